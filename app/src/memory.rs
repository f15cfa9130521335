// ==============================================================================
// memory.rs - In-Memory Repository
// ==============================================================================
// Description: Mutex-backed FileRepository + JobRepository for tests/dev runs
// Author: Matt Barham
// Created: 2026-10-14
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::execution_log::ExecutionLog;
use crate::models::{JobStatus, MergedFile, NewJob, NewMergedFile, ProcessingJob, UploadStatus};
use crate::repository::{FileRepository, JobRepository};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgressRow {
    pub upload_id: String,
    pub status: UploadStatus,
    pub progress: i32,
}

#[derive(Default)]
struct Tables {
    next_file_id: i64,
    next_job_id: i64,
    files: Vec<MergedFile>,
    upload_progress: HashMap<String, UploadProgressRow>,
    jobs: HashMap<i64, ProcessingJob>,
    started_at: HashMap<i64, DateTime<Utc>>,
    progress_history: HashMap<i64, Vec<i32>>,
    execution_logs: Vec<ExecutionLog>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a job with an explicit creation time (scheduler tests)
    pub fn insert_job_at(&self, job: NewJob, created_at: DateTime<Utc>) -> ProcessingJob {
        let mut tables = self.tables();
        tables.next_job_id += 1;
        let job = job.into_job(tables.next_job_id, created_at);
        tables.jobs.insert(job.id, job.clone());
        job
    }

    pub fn files(&self) -> Vec<MergedFile> {
        self.tables().files.clone()
    }

    pub fn upload_progress(&self, upload_id: &str) -> Option<UploadProgressRow> {
        self.tables().upload_progress.get(upload_id).cloned()
    }

    /// Every progress value written for a job, in order
    pub fn progress_history(&self, job_id: i64) -> Vec<i32> {
        self.tables()
            .progress_history
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn execution_logs(&self, job_id: i64) -> Vec<ExecutionLog> {
        self.tables()
            .execution_logs
            .iter()
            .filter(|log| log.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Backdate a processing job's start time (recovery tests)
    pub fn set_started_at(&self, job_id: i64, started_at: DateTime<Utc>) {
        self.tables().started_at.insert(job_id, started_at);
    }
}

#[async_trait]
impl FileRepository for MemoryRepository {
    async fn insert_file(&self, file: NewMergedFile) -> Result<MergedFile> {
        let mut tables = self.tables();
        tables.next_file_id += 1;
        let file = file.with_id(tables.next_file_id);
        tables.files.push(file.clone());
        Ok(file)
    }

    async fn files_by_ids(&self, project_id: i64, ids: &[i64]) -> Result<Vec<MergedFile>> {
        Ok(self
            .tables()
            .files
            .iter()
            .filter(|f| f.project_id == Some(project_id) && ids.contains(&f.id))
            .cloned()
            .collect())
    }

    async fn record_upload_progress(
        &self,
        upload_id: &str,
        status: UploadStatus,
        progress: i32,
    ) -> Result<()> {
        self.tables().upload_progress.insert(
            upload_id.to_string(),
            UploadProgressRow {
                upload_id: upload_id.to_string(),
                status,
                progress,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn create_job(&self, job: NewJob) -> Result<ProcessingJob> {
        Ok(self.insert_job_at(job, Utc::now()))
    }

    async fn get_job(&self, job_id: i64) -> Result<ProcessingJob> {
        self.tables()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(IngestError::JobNotFound(job_id))
    }

    async fn fetch_pending(&self, min_age: Duration, limit: i64) -> Result<Vec<ProcessingJob>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut pending: Vec<ProcessingJob> = self
            .tables()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.created_at <= cutoff)
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn transition(
        &self,
        job_id: i64,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<ProcessingJob> {
        let mut tables = self.tables();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(IngestError::JobNotFound(job_id))?;

        if !job.status.can_transition_to(to) {
            return Err(IngestError::InvalidTransition {
                job_id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        let job = job.clone();

        if to == JobStatus::Processing {
            tables.started_at.insert(job_id, Utc::now());
        }
        Ok(job)
    }

    async fn update_progress(&self, job_id: i64, progress: i32) -> Result<()> {
        let mut tables = self.tables();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(IngestError::JobNotFound(job_id))?;
        job.progress = progress;
        tables.progress_history.entry(job_id).or_default().push(progress);
        Ok(())
    }

    async fn record_error(&self, job_id: i64, error_message: &str) -> Result<()> {
        let mut tables = self.tables();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(IngestError::JobNotFound(job_id))?;
        job.error_message = Some(error_message.to_string());
        Ok(())
    }

    async fn start_execution(&self, log: &ExecutionLog) -> Result<i64> {
        let mut tables = self.tables();
        tables.execution_logs.push(log.clone());
        Ok(tables.execution_logs.len() as i64)
    }

    async fn finish_execution(&self, log_id: i64, log: &ExecutionLog) -> Result<()> {
        let mut tables = self.tables();
        if let Some(slot) = tables.execution_logs.get_mut((log_id - 1).max(0) as usize) {
            *slot = log.clone();
        }
        Ok(())
    }

    async fn recover_stuck(&self, older_than: Duration, error_message: &str) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tables = self.tables();

        let stuck: Vec<i64> = tables
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .filter(|job| {
                tables
                    .started_at
                    .get(&job.id)
                    .map_or(true, |started| *started <= cutoff)
            })
            .map(|job| job.id)
            .collect();

        for id in &stuck {
            if let Some(job) = tables.jobs.get_mut(id) {
                job.status = JobStatus::Failed;
                job.error_message = Some(error_message.to_string());
            }
        }
        Ok(stuck.len() as u64)
    }

    async fn requeue_processing(&self) -> Result<u64> {
        let mut tables = self.tables();
        let mut requeued = Vec::new();

        for job in tables.jobs.values_mut() {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.progress = 0;
                requeued.push(job.id);
            }
        }
        for id in &requeued {
            tables.started_at.remove(id);
        }
        Ok(requeued.len() as u64)
    }
}
