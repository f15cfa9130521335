// ==============================================================================
// config.rs - Runtime Configuration
// ==============================================================================
// Description: Typed settings for uploads, task queue, scheduler, dispatcher
// Author: Matt Barham
// Created: 2026-10-12
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================
//
// Every setting has a default; environment variables override them. Binaries
// call `dotenvy::dotenv()` before `IngestConfig::from_env()`.
//
// ==============================================================================

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// What the merger does when the content-addressed path already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep existing bytes, record a new file row pointing at them
    Reuse,
    /// Fail the merge with `DuplicateContent`
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reuse" => Ok(DuplicatePolicy::Reuse),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(format!("expected 'reuse' or 'reject', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root for staging directories and published files
    pub upload_root: PathBuf,
    pub max_chunk_bytes: usize,
    pub session_idle_timeout: Duration,
    pub eviction_interval: Duration,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("uploads"),
            max_chunk_bytes: 50 * MIB as usize,
            session_idle_timeout: Duration::from_secs(24 * 3600),
            eviction_interval: Duration::from_secs(3600),
            duplicate_policy: DuplicatePolicy::Reuse,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent_tasks: usize,
    /// Inputs above this are split into segments
    pub large_input_threshold: u64,
    pub segment_size: u64,
    pub segment_batch_width: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub pressure_retry_delay: Duration,
    /// Fraction of total memory in use above which admission defers
    pub memory_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            large_input_threshold: 5 * GIB,
            segment_size: 100 * MIB,
            segment_batch_width: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            pressure_retry_delay: Duration::from_millis(5000),
            memory_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub closing_margin: Duration,
    pub min_job_age: Duration,
    pub batch_limit: i64,
    pub utc_offset: FixedOffset,
    /// Jobs stuck in processing longer than this are failed on worker start
    pub stuck_job_cutoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            window_start_hour: 22,
            window_end_hour: 6,
            closing_margin: Duration::from_secs(15 * 60),
            min_job_age: Duration::from_secs(5 * 60),
            batch_limit: 10,
            utc_offset: FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix()),
            stuck_job_cutoff: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3178/api".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub upload: UploadConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
}

impl IngestConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (tests use a map)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = IngestConfig::default();
        let env = Env { lookup: &lookup };

        if let Some(root) = lookup("UPLOAD_ROOT") {
            config.upload.upload_root = PathBuf::from(root);
        }
        if let Some(bytes) = env.parse::<usize>("MAX_CHUNK_BYTES")? {
            config.upload.max_chunk_bytes = bytes;
        }
        if let Some(secs) = env.parse::<u64>("SESSION_IDLE_TIMEOUT_SECS")? {
            config.upload.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("SESSION_EVICTION_INTERVAL_SECS")? {
            config.upload.eviction_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = env.parse::<DuplicatePolicy>("DUPLICATE_POLICY")? {
            config.upload.duplicate_policy = policy;
        }

        if let Some(n) = env.parse::<usize>("MAX_CONCURRENT_TASKS")? {
            config.queue.max_concurrent_tasks = n.max(1);
        }
        if let Some(bytes) = env.parse::<u64>("LARGE_INPUT_THRESHOLD_BYTES")? {
            config.queue.large_input_threshold = bytes;
        }
        if let Some(bytes) = env.parse::<u64>("SEGMENT_SIZE_BYTES")? {
            config.queue.segment_size = bytes.max(1);
        }
        if let Some(width) = env.parse::<usize>("SEGMENT_BATCH_WIDTH")? {
            config.queue.segment_batch_width = width.max(1);
        }
        if let Some(retries) = env.parse::<u32>("MAX_RETRIES")? {
            config.queue.max_retries = retries;
        }
        if let Some(ms) = env.parse::<u64>("RETRY_BASE_DELAY_MS")? {
            config.queue.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("PRESSURE_RETRY_DELAY_MS")? {
            config.queue.pressure_retry_delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = env.parse::<f64>("MEMORY_THRESHOLD")? {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidValue {
                    key: "MEMORY_THRESHOLD",
                    value: threshold.to_string(),
                    reason: "must be between 0.0 and 1.0".to_string(),
                });
            }
            config.queue.memory_threshold = threshold;
        }

        if let Some(secs) = env.parse::<u64>("SCHEDULER_INTERVAL_SECS")? {
            config.scheduler.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(hour) = env.hour("WINDOW_START_HOUR")? {
            config.scheduler.window_start_hour = hour;
        }
        if let Some(hour) = env.hour("WINDOW_END_HOUR")? {
            config.scheduler.window_end_hour = hour;
        }
        if let Some(mins) = env.parse::<u64>("WINDOW_CLOSING_MARGIN_MINS")? {
            config.scheduler.closing_margin = Duration::from_secs(mins * 60);
        }
        if let Some(secs) = env.parse::<u64>("MIN_JOB_AGE_SECS")? {
            config.scheduler.min_job_age = Duration::from_secs(secs);
        }
        if let Some(limit) = env.parse::<i64>("SCHEDULER_BATCH_LIMIT")? {
            config.scheduler.batch_limit = limit.max(1);
        }
        if let Some(hours) = env.parse::<i32>("SCHEDULER_UTC_OFFSET_HOURS")? {
            config.scheduler.utc_offset =
                FixedOffset::east_opt(hours * 3600).ok_or_else(|| ConfigError::InvalidValue {
                    key: "SCHEDULER_UTC_OFFSET_HOURS",
                    value: hours.to_string(),
                    reason: "offset out of range".to_string(),
                })?;
        }
        if let Some(mins) = env.parse::<u64>("STUCK_JOB_CUTOFF_MINS")? {
            config.scheduler.stuck_job_cutoff = Duration::from_secs(mins * 60);
        }

        if let Some(url) = lookup("PROCESS_SERVICE_URL") {
            config.dispatcher.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = env.parse::<u64>("DISPATCH_TIMEOUT_SECS")? {
            config.dispatcher.timeout = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    fn hour(&self, key: &'static str) -> Result<Option<u32>, ConfigError> {
        match self.parse::<u32>(key)? {
            Some(hour) if hour > 23 => Err(ConfigError::InvalidValue {
                key,
                value: hour.to_string(),
                reason: "hour must be 0-23".to_string(),
            }),
            other => Ok(other),
        }
    }
}
