// ==============================================================================
// progress.rs - Job Progress Publication
// ==============================================================================
// Description: Publisher seam for live job progress (Redis in the worker)
// Author: Matt Barham
// Created: 2026-10-15
// Modified: 2026-10-17
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::JobStatus;

/// Message published on every progress change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: i64,
    pub status: JobStatus,
    pub progress: i32,
    pub message: String,
}

#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    /// Publication is best-effort; implementations log their own failures
    async fn publish(&self, update: ProgressUpdate);
}

/// Discards updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressPublisher;

#[async_trait]
impl ProgressPublisher for NoopProgressPublisher {
    async fn publish(&self, _update: ProgressUpdate) {}
}
