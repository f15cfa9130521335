// ==============================================================================
// models.rs - API Data Models
// ==============================================================================
// Description: Request/response models for the ingest API
// Author: Matt Barham
// Created: 2026-10-17
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use ingest_core::models::{ChunkOutcome, JobStatus, MergedFile, ProcessingJob};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Chunk submission response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    /// `duplicate`, `accepted` or `completed`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<MergedFile>,
}

impl From<ChunkOutcome> for ChunkResponse {
    fn from(outcome: ChunkOutcome) -> Self {
        match outcome {
            ChunkOutcome::Duplicate => Self {
                status: "duplicate",
                received_chunks: None,
                total_chunks: None,
                file: None,
            },
            ChunkOutcome::Accepted { received, total } => Self {
                status: "accepted",
                received_chunks: Some(received),
                total_chunks: Some(total),
                file: None,
            },
            ChunkOutcome::Completed(file) => Self {
                status: "completed",
                received_chunks: None,
                total_chunks: None,
                file: Some(file),
            },
        }
    }
}

/// Abandon an in-flight project upload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct AbandonResponse {
    pub abandoned: bool,
}

/// Task creation request
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[validate(range(min = 1))]
    pub project_id: i64,

    #[validate(length(min = 1, max = 100))]
    pub file_ids: Vec<i64>,

    #[validate(length(min = 1, max = 64))]
    pub task_type: String,

    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[validate(range(min = 0, max = 4))]
    pub data_format: i32,

    #[serde(default)]
    #[validate(range(min = 0, max = 10))]
    pub priority: i32,
}

/// Task status response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub task_type: String,
    pub data_format: i32,
    pub priority: i32,
    pub status: JobStatus,
    pub progress: i32,
    pub error_message: Option<String>,
    pub total_size: u64,
    pub file_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<ProcessingJob> for TaskResponse {
    fn from(job: ProcessingJob) -> Self {
        Self {
            id: job.id,
            project_id: job.project_id,
            file_ids: job.files.iter().map(|file| file.file_id).collect(),
            name: job.name,
            task_type: job.task_type,
            data_format: job.data_format.into(),
            priority: job.priority,
            status: job.status,
            progress: job.progress,
            error_message: job.error_message,
            total_size: job.total_size,
            created_at: job.created_at,
        }
    }
}

/// API information response
#[derive(Debug, Serialize)]
pub struct ApiInfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub database: bool,
    pub upload_root: bool,
    pub active_sessions: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}
