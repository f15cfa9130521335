// ==============================================================================
// execution_log.rs - Job Attempt Execution Log
// ==============================================================================
// Description: One record per dispatch attempt (timing, outcome, input sizes)
// Author: Matt Barham
// Created: 2026-10-14
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ProcessingJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub job_id: i64,
    pub task_type: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub total_size: u64,
    /// `{ "<file_name>": <bytes> }`
    pub file_sizes: serde_json::Value,
}

impl ExecutionLog {
    pub fn new(job: &ProcessingJob, attempt: u32) -> Self {
        Self {
            job_id: job.id,
            task_type: job.task_type.clone(),
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            success: None,
            error_message: None,
            total_size: job.total_size,
            file_sizes: serde_json::Value::Object(Default::default()),
        }
    }

    /// Stat every referenced file. Unreadable files are recorded as 0 bytes.
    pub async fn with_file_sizes(mut self, job: &ProcessingJob) -> Self {
        let mut sizes = serde_json::Map::new();
        for file in &job.files {
            let size = match tokio::fs::metadata(&file.file_path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    debug!("Cannot stat {} for job {}: {}", file.file_path, job.id, e);
                    0
                }
            };
            sizes.insert(file.file_name.clone(), serde_json::Value::from(size));
        }
        self.file_sizes = serde_json::Value::Object(sizes);
        self
    }

    pub fn finish(&mut self, success: bool, error_message: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.success = Some(success);
        self.error_message = error_message;
    }

    /// Wall-clock seconds between start and finish
    pub fn execution_secs(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds())
    }
}
