// ==============================================================================
// postgres.rs - PostgreSQL Repository
// ==============================================================================
// Description: sqlx-backed FileRepository + JobRepository
// Author: Matt Barham
// Created: 2026-10-14
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
//
// Runtime queries with `.bind(..)` (no compile-time DATABASE_URL needed).
// Status changes are a single conditional UPDATE, so two writers can never
// both move a job out of the same state.
//
// ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::execution_log::ExecutionLog;
use crate::models::{
    DataFormat, JobFile, JobStatus, MergedFile, NewJob, NewMergedFile, ProcessingJob, UploadStatus,
};
use crate::repository::{FileRepository, JobRepository};

/// Embedded schema migrations (app/migrations)
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const ALL_STATUSES: [JobStatus; 5] = [
    JobStatus::Pending,
    JobStatus::Processing,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

const JOB_COLUMNS: &str = "id, project_id, user_id, name, task_type, data_format, priority, \
                           files, total_size, status, progress, error_message, created_at";

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FileRecord {
    id: i64,
    project_id: Option<i64>,
    user_id: Option<i64>,
    file_name: String,
    file_path: String,
    file_size: i64,
    digest: String,
}

impl From<FileRecord> for MergedFile {
    fn from(row: FileRecord) -> Self {
        MergedFile {
            id: row.id,
            project_id: row.project_id,
            user_id: row.user_id,
            file_name: row.file_name,
            file_path: row.file_path,
            file_size: row.file_size.max(0) as u64,
            digest: row.digest,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRecord {
    id: i64,
    project_id: i64,
    user_id: i64,
    name: String,
    task_type: String,
    data_format: i32,
    priority: i32,
    files: Json<Vec<JobFile>>,
    total_size: i64,
    status: String,
    progress: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for ProcessingJob {
    type Error = IngestError;

    fn try_from(row: JobRecord) -> Result<Self> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            IngestError::Database(sqlx::Error::Decode(
                format!("unknown job status '{}' on job {}", row.status, row.id).into(),
            ))
        })?;

        Ok(ProcessingJob {
            id: row.id,
            project_id: row.project_id,
            user_id: row.user_id,
            name: row.name,
            task_type: row.task_type,
            data_format: DataFormat::try_from(row.data_format)?,
            priority: row.priority,
            files: row.files.0,
            total_size: row.total_size.max(0) as u64,
            created_at: row.created_at,
            status,
            progress: row.progress,
            error_message: row.error_message,
        })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl FileRepository for PgRepository {
    async fn insert_file(&self, file: NewMergedFile) -> Result<MergedFile> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO project_files (project_id, user_id, file_name, file_path, file_size, digest)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(file.project_id)
        .bind(file.user_id)
        .bind(&file.file_name)
        .bind(&file.file_path)
        .bind(file.file_size as i64)
        .bind(&file.digest)
        .fetch_one(&self.pool)
        .await?;

        debug!("Recorded file {} as id {}", file.file_path, id);
        Ok(file.with_id(id))
    }

    async fn files_by_ids(&self, project_id: i64, ids: &[i64]) -> Result<Vec<MergedFile>> {
        let rows: Vec<FileRecord> = sqlx::query_as(
            r#"
            SELECT id, project_id, user_id, file_name, file_path, file_size, digest
            FROM project_files
            WHERE project_id = $1 AND id = ANY($2)
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MergedFile::from).collect())
    }

    async fn record_upload_progress(
        &self,
        upload_id: &str,
        status: UploadStatus,
        progress: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_progress (upload_id, status, progress, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (upload_id)
            DO UPDATE SET status = EXCLUDED.status,
                          progress = EXCLUDED.progress,
                          updated_at = NOW()
            "#,
        )
        .bind(upload_id)
        .bind(status.as_str())
        .bind(progress.clamp(0, 100))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgRepository {
    async fn create_job(&self, job: NewJob) -> Result<ProcessingJob> {
        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO project_tasks
                (project_id, user_id, name, task_type, data_format, priority, files, total_size, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')
            RETURNING id, created_at
            "#,
        )
        .bind(job.project_id)
        .bind(job.user_id)
        .bind(&job.name)
        .bind(&job.task_type)
        .bind(i32::from(job.data_format))
        .bind(job.priority)
        .bind(Json(&job.files))
        .bind(job.total_size as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(job.into_job(id, created_at))
    }

    async fn get_job(&self, job_id: i64) -> Result<ProcessingJob> {
        let row: Option<JobRecord> =
            sqlx::query_as(&format!("SELECT {} FROM project_tasks WHERE id = $1", JOB_COLUMNS))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(IngestError::JobNotFound(job_id))?.try_into()
    }

    async fn fetch_pending(&self, min_age: Duration, limit: i64) -> Result<Vec<ProcessingJob>> {
        let cutoff = Utc::now() - to_chrono(min_age);
        let rows: Vec<JobRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM project_tasks
             WHERE status = 'pending' AND created_at <= $1
             ORDER BY priority DESC, created_at ASC
             LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProcessingJob::try_from).collect()
    }

    async fn transition(
        &self,
        job_id: i64,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<ProcessingJob> {
        let allowed_from: Vec<&str> = ALL_STATUSES
            .iter()
            .filter(|from| from.can_transition_to(to))
            .map(|from| from.as_str())
            .collect();

        let row: Option<JobRecord> = sqlx::query_as(&format!(
            "UPDATE project_tasks
             SET status = $2,
                 error_message = COALESCE($3, error_message),
                 started_at = CASE WHEN $2 = 'processing' THEN NOW() ELSE started_at END,
                 completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled')
                                     THEN NOW() ELSE completed_at END,
                 updated_at = NOW()
             WHERE id = $1 AND status = ANY($4)
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(to.as_str())
        .bind(error_message)
        .bind(&allowed_from)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let current = self.get_job(job_id).await?;
                Err(IngestError::InvalidTransition {
                    job_id,
                    from: current.status,
                    to,
                })
            }
        }
    }

    async fn update_progress(&self, job_id: i64, progress: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE project_tasks SET progress = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .bind(progress.clamp(0, 100))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn record_error(&self, job_id: i64, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE project_tasks SET error_message = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn start_execution(&self, log: &ExecutionLog) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO task_execution_logs
                (task_id, task_type, attempt, start_time, total_file_size, file_sizes)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(log.job_id)
        .bind(&log.task_type)
        .bind(log.attempt as i32)
        .bind(log.started_at)
        .bind(log.total_size as i64)
        .bind(&log.file_sizes)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn finish_execution(&self, log_id: i64, log: &ExecutionLog) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_execution_logs
            SET end_time = $2, execution_time = $3, success = $4, error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(log_id)
        .bind(log.finished_at)
        .bind(log.execution_secs())
        .bind(log.success)
        .bind(&log.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recover_stuck(&self, older_than: Duration, error_message: &str) -> Result<u64> {
        let cutoff = Utc::now() - to_chrono(older_than);

        let recovered: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE project_tasks
            SET status = 'failed', error_message = $2, completed_at = NOW(), updated_at = NOW()
            WHERE status = 'processing' AND (started_at IS NULL OR started_at < $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(error_message)
        .fetch_all(&self.pool)
        .await?;

        for id in &recovered {
            warn!("Marked stuck job {} as failed", id);
        }
        Ok(recovered.len() as u64)
    }

    async fn requeue_processing(&self) -> Result<u64> {
        let requeued: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE project_tasks
            SET status = 'pending', progress = 0, started_at = NULL, updated_at = NOW()
            WHERE status = 'processing'
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for id in &requeued {
            warn!("Returned interrupted job {} to the queue", id);
        }
        Ok(requeued.len() as u64)
    }
}
