// ==============================================================================
// repository.rs - Persistence Interfaces
// ==============================================================================
// Description: Storage traits for file entities, upload progress, jobs, logs
// Author: Matt Barham
// Created: 2026-10-13
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
//
// `PgRepository` (postgres.rs) backs both traits in production;
// `MemoryRepository` (memory.rs) backs them in tests and local runs.
//
// ==============================================================================

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::execution_log::ExecutionLog;
use crate::models::{JobStatus, MergedFile, NewJob, NewMergedFile, ProcessingJob, UploadStatus};

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn insert_file(&self, file: NewMergedFile) -> Result<MergedFile>;

    /// Files of one project matching `ids`; unknown ids are simply absent
    async fn files_by_ids(&self, project_id: i64, ids: &[i64]) -> Result<Vec<MergedFile>>;

    async fn record_upload_progress(
        &self,
        upload_id: &str,
        status: UploadStatus,
        progress: i32,
    ) -> Result<()>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<ProcessingJob>;

    /// Fails with `JobNotFound`
    async fn get_job(&self, job_id: i64) -> Result<ProcessingJob>;

    /// Pending jobs created at least `min_age` ago, priority DESC, created ASC
    async fn fetch_pending(&self, min_age: Duration, limit: i64) -> Result<Vec<ProcessingJob>>;

    /// Atomic status change guarded by `JobStatus::can_transition_to`.
    /// `error_message` is stored when moving to `failed`.
    async fn transition(
        &self,
        job_id: i64,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<ProcessingJob>;

    async fn update_progress(&self, job_id: i64, progress: i32) -> Result<()>;

    /// Remember the latest attempt error without changing status
    async fn record_error(&self, job_id: i64, error_message: &str) -> Result<()>;

    /// Returns the log row id
    async fn start_execution(&self, log: &ExecutionLog) -> Result<i64>;

    async fn finish_execution(&self, log_id: i64, log: &ExecutionLog) -> Result<()>;

    /// Fail jobs that have been `processing` for longer than `older_than`
    async fn recover_stuck(&self, older_than: Duration, error_message: &str) -> Result<u64>;

    /// Return every remaining `processing` job to `pending` with its progress
    /// reset. Only called at startup, before any dispatch, when no job can
    /// really be running.
    async fn requeue_processing(&self) -> Result<u64>;
}
