// ==============================================================================
// resource.rs - Resource Pressure Monitoring
// ==============================================================================
// Description: Memory-pressure probe consulted before admitting work
// Author: Matt Barham
// Created: 2026-10-15
// Modified: 2026-10-17
// Version: 1.0.0
// ==============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use tracing::debug;

pub trait ResourceMonitor: Send + Sync {
    /// True when new work should be deferred
    fn under_pressure(&self) -> bool;
}

/// Samples system memory through `sysinfo`
pub struct SystemResourceMonitor {
    system: Mutex<System>,
    threshold: f64,
}

impl SystemResourceMonitor {
    /// `threshold` is the used/total memory ratio above which pressure is reported
    pub fn new(threshold: f64) -> Self {
        Self {
            system: Mutex::new(System::new()),
            threshold,
        }
    }

    pub fn memory_usage(&self) -> f64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64
    }
}

impl ResourceMonitor for SystemResourceMonitor {
    fn under_pressure(&self) -> bool {
        let usage = self.memory_usage();
        let overloaded = usage > self.threshold;
        if overloaded {
            debug!(
                "Memory usage {:.1}% exceeds threshold {:.1}%",
                usage * 100.0,
                self.threshold * 100.0
            );
        }
        overloaded
    }
}

/// Switchable monitor for tests and for disabling pressure checks
#[derive(Debug, Default)]
pub struct ManualResourceMonitor {
    pressure: AtomicBool,
}

impl ManualResourceMonitor {
    pub fn new(pressure: bool) -> Self {
        Self {
            pressure: AtomicBool::new(pressure),
        }
    }

    pub fn set_pressure(&self, pressure: bool) {
        self.pressure.store(pressure, Ordering::SeqCst);
    }
}

impl ResourceMonitor for ManualResourceMonitor {
    fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::SeqCst)
    }
}
