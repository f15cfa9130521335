// ==============================================================================
// handlers.rs - API Request Handlers
// ==============================================================================
// Description: HTTP request handlers for chunk ingestion and task endpoints
// Author: Matt Barham
// Created: 2026-10-17
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use axum::{
    body::Bytes,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use ingest_core::models::{DataFormat, JobFile, JobStatus, NewJob, SessionKey};
use ingest_core::session::completed_file;
use ingest_core::validator::{file_extension, normalize_extension};
use ingest_core::IngestError;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::{middleware::AuthUser, models::*, state::AppState};

/// Root endpoint - API information
pub async fn root() -> Json<ApiInfoResponse> {
    Json(ApiInfoResponse {
        service: "Ingest API Gateway",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "/health - Health check",
            "/ready - Readiness check",
            "/api/uploads/chunk - Upload a project file chunk (POST)",
            "/api/uploads/content - Upload a content-addressed chunk (POST)",
            "/api/uploads/abandon - Abandon an in-flight upload (POST)",
            "/api/tasks - Create a processing task (POST)",
            "/api/tasks/{id} - Task status (GET)",
            "/api/tasks/{id}/cancel - Cancel a task (PUT)",
        ],
    })
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ready = match state.db_pool() {
        Some(pool) => sqlx::query("SELECT 1").fetch_one(pool).await.is_ok(),
        None => true,
    };

    let root_ready = tokio::fs::metadata(&state.config().upload.upload_root)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);

    let ready = db_ready && root_ready;

    let response = ReadinessResponse {
        ready,
        database: db_ready,
        upload_root: root_ready,
        active_sessions: state.sessions().session_count(),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// Text fields plus the `file` part of a chunk upload form
#[derive(Debug, Default)]
struct ChunkForm {
    fields: HashMap<String, String>,
    data: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = ChunkForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read multipart field: {}", e)))?
        {
            let name = field.name().unwrap_or("").to_string();

            if name == "file" {
                form.data = Some(field.bytes().await.map_err(|e| {
                    AppError::BadRequest(format!("Failed to read chunk data: {}", e))
                })?);
            } else if !name.is_empty() {
                let value = field.text().await.map_err(|e| {
                    AppError::BadRequest(format!("Failed to read {}: {}", name, e))
                })?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    fn optional(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &str) -> Result<&str, AppError> {
        self.optional(name)
            .ok_or_else(|| AppError::BadRequest(format!("Missing {}", name)))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<T, AppError> {
        self.required(name)?
            .parse()
            .map_err(|_| AppError::BadRequest(format!("Invalid {}", name)))
    }

    /// Chunk position fields. Negative values are chunk metadata errors.
    fn position(&self) -> Result<(u32, u32), AppError> {
        let index: i64 = self.parse("index")?;
        let total: i64 = self.parse("totalChunks")?;

        let index = u32::try_from(index).map_err(|_| {
            IngestError::InvalidChunkMetadata(format!("chunk index {} is out of range", index))
        })?;
        let total = u32::try_from(total).map_err(|_| {
            IngestError::InvalidChunkMetadata(format!("total chunk count {} is out of range", total))
        })?;
        Ok((index, total))
    }

    fn take_data(&mut self) -> Result<Bytes, AppError> {
        self.data
            .take()
            .ok_or_else(|| AppError::BadRequest("Missing file".to_string()))
    }
}

/// Submit one chunk of a project file
#[instrument(skip(state, multipart))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let mut form = ChunkForm::read(multipart).await?;

    let project_id: i64 = form.parse("projectId")?;
    let user_id: i64 = form.parse("userId")?;
    let (index, total) = form.position()?;
    let data = form.take_data()?;

    // An extension sent separately is appended when the name carries none
    let mut file_name = form.required("fileName")?.to_string();
    if let Some(extension) = form.optional("fileExtension") {
        if file_extension(&file_name).is_empty() {
            file_name.push_str(&normalize_extension(extension)?);
        }
    }

    let key = SessionKey::project(project_id, user_id, &file_name)?;
    debug!("Chunk {}/{} for {} ({} bytes)", index + 1, total, key, data.len());

    let outcome = state.sessions().submit_chunk(&key, index, total, &data).await?;
    if let Some(file) = completed_file(&outcome) {
        info!(
            "Upload {} merged into file {} ({} bytes)",
            key, file.id, file.file_size
        );
    }

    Ok(Json(ChunkResponse::from(outcome)))
}

/// Submit one chunk of a content-addressed upload keyed by the client's MD5
#[instrument(skip(state, multipart))]
pub async fn upload_content(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let mut form = ChunkForm::read(multipart).await?;

    let (index, total) = form.position()?;
    let data = form.take_data()?;
    let key = SessionKey::content(form.required("md5")?, form.optional("fileExtension"))?;

    let outcome = state.sessions().submit_chunk(&key, index, total, &data).await?;
    if let Some(file) = completed_file(&outcome) {
        info!("Content upload {} stored at {}", key, file.file_path);
    }

    Ok(Json(ChunkResponse::from(outcome)))
}

/// Abandon an in-flight project upload and delete its staged chunks
#[instrument(skip(state))]
pub async fn abandon_upload(
    State(state): State<AppState>,
    Json(request): Json<AbandonRequest>,
) -> Result<Json<AbandonResponse>, AppError> {
    let key = SessionKey::project(request.project_id, request.user_id, &request.file_name)?;
    let abandoned = state.sessions().abandon(&key).await?;

    if !abandoned {
        debug!("No upload session for {}", key);
    }
    Ok(Json(AbandonResponse { abandoned }))
}

/// Create a pending processing task over previously uploaded files
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn create_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), AppError> {
    request
        .validate()
        .map_err(|e| AppError::BadRequest(format!("Invalid task request: {}", e)))?;

    let ids: Vec<i64> = request
        .file_ids
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let files = state.files().files_by_ids(request.project_id, &ids).await?;

    if files.len() != ids.len() {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !files.iter().any(|file| file.id == **id))
            .map(|id| id.to_string())
            .collect();
        return Err(IngestError::InvalidJobRequest(format!(
            "files not found in project {}: {}",
            request.project_id,
            missing.join(", ")
        ))
        .into());
    }

    let total_size = files.iter().map(|file| file.file_size).sum();
    let job = NewJob {
        project_id: request.project_id,
        user_id,
        name: request.name.trim().to_string(),
        task_type: request.task_type.trim().to_string(),
        data_format: DataFormat::try_from(request.data_format)?,
        priority: request.priority,
        files: files
            .into_iter()
            .map(|file| JobFile {
                file_id: file.id,
                file_name: file.file_name,
                file_path: file.file_path,
            })
            .collect(),
        total_size,
    };

    let job = state.jobs().create_job(job).await?;
    info!("Created task {} ({} bytes across {} file(s))", job.id, job.total_size, job.files.len());

    Ok((StatusCode::CREATED, Json(TaskResponse::from(job))))
}

/// Task status; only visible to its owner
pub async fn get_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskResponse>, AppError> {
    let job = state.jobs().get_job(task_id).await?;
    if job.user_id != user_id {
        return Err(AppError::NotFound(format!("Task {} not found", task_id)));
    }
    Ok(Json(TaskResponse::from(job)))
}

/// Cancel a pending or processing task
#[instrument(skip(state))]
pub async fn cancel_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskResponse>, AppError> {
    let job = state.jobs().get_job(task_id).await?;
    if job.user_id != user_id {
        warn!("User {} tried to cancel task {} owned by {}", user_id, task_id, job.user_id);
        return Err(AppError::Forbidden);
    }

    let job = state
        .jobs()
        .transition(task_id, JobStatus::Cancelled, None)
        .await?;
    info!("Task {} cancelled by its owner", task_id);

    Ok(Json(TaskResponse::from(job)))
}

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("access denied")]
    Forbidden,
    #[error("{0}")]
    Internal(String),
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidChunkMetadata(_) | IngestError::InvalidJobRequest(_) => {
                AppError::BadRequest(err.to_string())
            }
            IngestError::ChunkConflict { .. }
            | IngestError::DuplicateContent { .. }
            | IngestError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            IngestError::JobNotFound(_) => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_details("Resource not found", msg),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new(msg)),
            AppError::Forbidden => (StatusCode::FORBIDDEN, ErrorResponse::new("Access denied")),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::models::ChunkOutcome;

    fn status_of(err: IngestError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_ingest_error_status_mapping() {
        assert_eq!(
            status_of(IngestError::InvalidChunkMetadata("index 3 >= total 3".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(IngestError::ChunkConflict {
                index: 1,
                reason: "different bytes".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(IngestError::DuplicateContent { digest: "ab".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(IngestError::InvalidTransition {
                job_id: 1,
                from: JobStatus::Completed,
                to: JobStatus::Cancelled
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(IngestError::JobNotFound(9)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(IngestError::IncompleteUpload {
                upload_id: "3_8_a.txt".into(),
                reason: "chunk 2 missing".into(),
                missing_index: Some(2),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_duplicate_chunk_response_has_no_counts() {
        let json = serde_json::to_value(ChunkResponse::from(ChunkOutcome::Duplicate)).unwrap();
        assert_eq!(json["status"], "duplicate");
        assert!(json.get("receivedChunks").is_none());
    }
}
