// ==============================================================================
// retry.rs - Dispatch Retry Policy
// ==============================================================================
// Description: Bounded exponential backoff (delay = 2^attempt * base)
// Author: Matt Barham
// Created: 2026-10-15
// Modified: 2026-10-15
// Version: 1.0.0
// ==============================================================================

use std::time::Duration;

use crate::config::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay)
    }

    /// Delay before retry number `attempt + 1`, where `attempt` counts
    /// failures already retried (0 for the first failure)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
    }

    /// Whether a job that has already been retried `attempt` times may retry again
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_limit() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_large_attempts_saturate() {
        let policy = RetryPolicy::new(100, Duration::from_millis(10));
        assert!(policy.delay(64) >= policy.delay(31));
    }
}
