// ==============================================================================
// dispatcher.rs - Processing Service Dispatch
// ==============================================================================
// Description: Maps job files to processing-service roles and submits jobs
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::DispatcherConfig;
use crate::error::{IngestError, Result};
use crate::models::{JobFile, ProcessingJob};
use crate::task_queue::{JobExecutor, Segment};

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Contains(&'static str),
    EndsWith(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum RoleValue {
    Path,
    ParentDir,
}

#[derive(Debug, Clone, Copy)]
pub struct RoleRule {
    pattern: Pattern,
    field: &'static str,
    value: RoleValue,
}

/// File roles understood by the processing service. Patterns are matched
/// case-insensitively; the first matching file wins per role.
pub const ROLE_TABLE: &[RoleRule] = &[
    RoleRule { pattern: Pattern::Contains("matrix.mtx.gz"), field: "mat_path", value: RoleValue::ParentDir },
    RoleRule { pattern: Pattern::Contains("barcodes_pos.tsv"), field: "barcodes_pos_path", value: RoleValue::Path },
    RoleRule { pattern: Pattern::EndsWith(".npy"), field: "npy_path", value: RoleValue::Path },
    RoleRule { pattern: Pattern::EndsWith(".h5"), field: "H5Path", value: RoleValue::Path },
    RoleRule { pattern: Pattern::EndsWith(".h5ad"), field: "H5ADPath", value: RoleValue::Path },
    RoleRule { pattern: Pattern::Contains(".csv.gz"), field: "CSVGZPath", value: RoleValue::Path },
];

impl RoleRule {
    fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.to_lowercase();
        match self.pattern {
            Pattern::Contains(needle) => candidate.contains(needle),
            Pattern::EndsWith(suffix) => candidate.ends_with(suffix),
        }
    }

    fn value_for(&self, file: &JobFile) -> String {
        match self.value {
            RoleValue::Path => file.file_path.clone(),
            RoleValue::ParentDir => Path::new(&file.file_path)
                .parent()
                .map(|dir| dir.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Role fields for a job's files. Rules match the logical file name or the
/// stored path; values always carry the stored (physical) location.
pub fn map_roles(files: &[JobFile]) -> BTreeMap<String, String> {
    ROLE_TABLE
        .iter()
        .filter_map(|rule| {
            files
                .iter()
                .find(|file| rule.matches(&file.file_name) || rule.matches(&file.file_path))
                .map(|file| (rule.field.to_string(), rule.value_for(file)))
        })
        .collect()
}

/// JSON body posted to `<base>/process`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub task_id: i64,
    pub task_type: String,
    pub data_format: i32,
    pub name: String,
    #[serde(flatten)]
    pub roles: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<Segment>,
}

impl ProcessRequest {
    pub fn for_job(job: &ProcessingJob, segment: Option<Segment>) -> Self {
        Self {
            task_id: job.id,
            task_type: job.task_type.clone(),
            data_format: job.data_format.into(),
            name: job.name.clone(),
            roles: map_roles(&job.files),
            segment,
        }
    }
}

/// The downstream processing service
#[async_trait]
pub trait ProcessingService: Send + Sync {
    async fn submit(&self, request: &ProcessRequest) -> Result<()>;
}

pub struct HttpProcessingService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProcessingService {
    pub fn new(config: &DispatcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IngestError::DownstreamUnavailable(format!("HTTP client setup: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/process", config.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ProcessingService for HttpProcessingService {
    async fn submit(&self, request: &ProcessRequest) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| IngestError::DownstreamUnavailable(e.to_string()))?;

        response
            .error_for_status()
            .map_err(|e| IngestError::DownstreamUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// Queue executor that forwards jobs to a [`ProcessingService`]
pub struct TaskDispatcher {
    service: Arc<dyn ProcessingService>,
    timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(service: Arc<dyn ProcessingService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

#[async_trait]
impl JobExecutor for TaskDispatcher {
    #[instrument(skip(self, job), fields(job_id = job.id))]
    async fn execute(&self, job: &ProcessingJob, segment: Option<Segment>) -> Result<()> {
        let request = ProcessRequest::for_job(job, segment);
        debug!("Dispatching job {} with roles {:?}", job.id, request.roles.keys());

        match tokio::time::timeout(self.timeout, self.service.submit(&request)).await {
            Ok(result) => {
                result?;
                if segment.is_none() {
                    info!("Processing service accepted job {}", job.id);
                }
                Ok(())
            }
            Err(_) => Err(IngestError::DownstreamUnavailable(format!(
                "no response within {:?}",
                self.timeout
            ))),
        }
    }
}
