// ==============================================================================
// error.rs - Ingest Error Taxonomy
// ==============================================================================
// Description: Typed errors for chunk ingestion, merging, and job dispatch
// Author: Matt Barham
// Created: 2026-10-12
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use thiserror::Error;

use crate::models::JobStatus;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad chunk index / total, or a total that disagrees with the session
    #[error("invalid chunk metadata: {0}")]
    InvalidChunkMetadata(String),

    /// Index already holds different bytes, or is being written right now
    #[error("chunk {index} conflicts with stored data: {reason}")]
    ChunkConflict { index: u32, reason: String },

    /// Merge attempted while a chunk is absent on disk
    #[error("upload {upload_id} is incomplete: {reason}")]
    IncompleteUpload {
        upload_id: String,
        reason: String,
        missing_index: Option<u32>,
    },

    #[error("content {digest} already exists")]
    DuplicateContent { digest: String },

    #[error("processing service unavailable: {0}")]
    DownstreamUnavailable(String),

    /// Deferral signal, never recorded as a job failure
    #[error("resource pressure: {0}")]
    ResourcePressure(String),

    #[error("invalid job request: {0}")]
    InvalidJobRequest(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl IngestError {
    /// Errors that originate with the client and leave no state behind
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidChunkMetadata(_)
                | IngestError::ChunkConflict { .. }
                | IngestError::DuplicateContent { .. }
                | IngestError::InvalidJobRequest(_)
                | IngestError::InvalidTransition { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {key} has invalid value '{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}
