// ==============================================================================
// models.rs - Upload and Job Data Models
// ==============================================================================
// Description: Session keys, merged file records, and processing job state
// Author: Matt Barham
// Created: 2026-10-12
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{IngestError, Result};
use crate::hasher::digest_hex;
use crate::validator;

/// Hex digits of the file name digest used in project upload ids
const NAME_DIGEST_LEN: usize = 16;

/// Identity of one in-flight upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionKey {
    /// Project route: chunks grouped by (project, user, file name)
    Project {
        project_id: i64,
        user_id: i64,
        file_name: String,
    },
    /// Content route: chunks grouped by a client-computed content scope
    Content { scope: String, extension: String },
}

impl SessionKey {
    /// Build a project-route key. The file name is checked and kept as sent;
    /// paths derived from the key use a digest of it instead.
    pub fn project(project_id: i64, user_id: i64, file_name: &str) -> Result<Self> {
        if project_id <= 0 || user_id <= 0 {
            return Err(IngestError::InvalidChunkMetadata(format!(
                "project id {} / user id {} must be positive",
                project_id, user_id
            )));
        }
        Ok(SessionKey::Project {
            project_id,
            user_id,
            file_name: validator::validate_filename(file_name)?,
        })
    }

    /// Build a content-route key from a client supplied scope (e.g. an MD5)
    pub fn content(scope: &str, extension: Option<&str>) -> Result<Self> {
        let scope = scope.trim();
        if scope.is_empty() || scope.len() > 128 || !scope.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IngestError::InvalidChunkMetadata(format!(
                "content scope '{}' must be 1-128 alphanumeric characters",
                scope
            )));
        }
        Ok(SessionKey::Content {
            scope: scope.to_lowercase(),
            extension: validator::normalize_extension(extension.unwrap_or(""))?,
        })
    }

    /// Staging identifier; also the staging directory name
    pub fn upload_id(&self) -> String {
        match self {
            SessionKey::Project {
                project_id,
                user_id,
                file_name,
            } => {
                let name_digest = digest_hex(file_name.as_bytes());
                format!("{}_{}_{}", project_id, user_id, &name_digest[..NAME_DIGEST_LEN])
            }
            SessionKey::Content { scope, .. } => format!("content_{}", scope),
        }
    }

    /// Directory (relative to the upload root) that receives merged output
    pub fn output_subdir(&self) -> PathBuf {
        match self {
            SessionKey::Project { project_id, .. } => PathBuf::from(project_id.to_string()),
            SessionKey::Content { .. } => PathBuf::new(),
        }
    }

    /// Extension (with leading dot) carried onto the published file
    pub fn target_extension(&self) -> String {
        match self {
            SessionKey::Project { file_name, .. } => {
                validator::normalize_extension(&validator::file_extension(file_name))
                    .unwrap_or_default()
            }
            SessionKey::Content { extension, .. } => extension.clone(),
        }
    }

    pub fn logical_name(&self) -> String {
        match self {
            SessionKey::Project { file_name, .. } => file_name.clone(),
            SessionKey::Content { scope, extension } => format!("{}{}", scope, extension),
        }
    }

    pub fn project_id(&self) -> Option<i64> {
        match self {
            SessionKey::Project { project_id, .. } => Some(*project_id),
            SessionKey::Content { .. } => None,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            SessionKey::Project { user_id, .. } => Some(*user_id),
            SessionKey::Content { .. } => None,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.upload_id())
    }
}

/// Result of submitting one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Index was already stored with identical bytes
    Duplicate,
    Accepted { received: u32, total: u32 },
    Completed(MergedFile),
}

/// File entity published by the merger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFile {
    pub id: i64,
    pub project_id: Option<i64>,
    pub user_id: Option<i64>,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub digest: String,
}

/// Insert form of [`MergedFile`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewMergedFile {
    pub project_id: Option<i64>,
    pub user_id: Option<i64>,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub digest: String,
}

impl NewMergedFile {
    pub fn with_id(self, id: i64) -> MergedFile {
        MergedFile {
            id,
            project_id: self.project_id,
            user_id: self.user_id,
            file_name: self.file_name,
            file_path: self.file_path,
            file_size: self.file_size,
            digest: self.digest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Merging,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Merging => "merging",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

/// Job status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed edges: pending→processing→{completed, failed}, plus
    /// {pending, processing}→cancelled.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data format flag forwarded to the processing service (0-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct DataFormat(u8);

impl DataFormat {
    pub const MAX: u8 = 4;

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for DataFormat {
    fn default() -> Self {
        DataFormat(0)
    }
}

impl TryFrom<i32> for DataFormat {
    type Error = IngestError;

    fn try_from(value: i32) -> Result<Self> {
        if (0..=DataFormat::MAX as i32).contains(&value) {
            Ok(DataFormat(value as u8))
        } else {
            Err(IngestError::InvalidJobRequest(format!(
                "data format must be between 0 and {}, got {}",
                DataFormat::MAX,
                value
            )))
        }
    }
}

impl From<DataFormat> for i32 {
    fn from(format: DataFormat) -> Self {
        format.0 as i32
    }
}

/// One file referenced by a job: logical name plus physical path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFile {
    pub file_id: i64,
    pub file_name: String,
    pub file_path: String,
}

/// Processing job as stored and scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub name: String,
    pub task_type: String,
    pub data_format: DataFormat,
    pub priority: i32,
    pub files: Vec<JobFile>,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub progress: i32,
    pub error_message: Option<String>,
}

/// Insert form of [`ProcessingJob`]; new jobs always start pending
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub project_id: i64,
    pub user_id: i64,
    pub name: String,
    pub task_type: String,
    pub data_format: DataFormat,
    pub priority: i32,
    pub files: Vec<JobFile>,
    pub total_size: u64,
}

impl NewJob {
    pub fn into_job(self, id: i64, created_at: DateTime<Utc>) -> ProcessingJob {
        ProcessingJob {
            id,
            project_id: self.project_id,
            user_id: self.user_id,
            name: self.name,
            task_type: self.task_type,
            data_format: self.data_format,
            priority: self.priority,
            files: self.files,
            total_size: self.total_size,
            created_at,
            status: JobStatus::Pending,
            progress: 0,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    #[test]
    fn test_pending_cannot_skip_processing() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("queued"), None);
    }

    #[test]
    fn test_data_format_range() {
        assert_eq!(DataFormat::try_from(0).unwrap().value(), 0);
        assert_eq!(DataFormat::try_from(4).unwrap().value(), 4);
        assert!(DataFormat::try_from(5).is_err());
        assert!(DataFormat::try_from(-1).is_err());
    }

    #[test]
    fn test_project_key_upload_id() {
        let key = SessionKey::project(12, 3, "sample.matrix.mtx.gz").unwrap();
        let name_digest = digest_hex(b"sample.matrix.mtx.gz");
        assert_eq!(key.upload_id(), format!("12_3_{}", &name_digest[..16]));
        assert_eq!(key.logical_name(), "sample.matrix.mtx.gz");
        assert_eq!(key.output_subdir(), PathBuf::from("12"));
        assert_eq!(key.target_extension(), ".mtx.gz");
    }

    #[test]
    fn test_project_key_rejects_traversal() {
        assert!(SessionKey::project(1, 1, "../../etc/passwd").is_err());
        assert!(SessionKey::project(1, 1, ".bashrc").is_err());
    }

    #[test]
    fn test_unicode_names_get_distinct_keys() {
        let first = SessionKey::project(1, 1, "样本A.h5ad").unwrap();
        let second = SessionKey::project(1, 1, "数据A.h5ad").unwrap();

        assert_ne!(first, second);
        assert_ne!(first.upload_id(), second.upload_id());
        assert_eq!(first.target_extension(), ".h5ad");
        assert_eq!(first.logical_name(), "样本A.h5ad");
        assert!(first.upload_id().is_ascii());
    }

    #[test]
    fn test_unusual_extension_is_dropped() {
        let key = SessionKey::project(1, 1, "notes.文本").unwrap();
        assert_eq!(key.target_extension(), "");
    }

    #[test]
    fn test_content_key_requires_alphanumeric_scope() {
        let key = SessionKey::content("ABCdef0123", Some(".h5ad")).unwrap();
        assert_eq!(key.upload_id(), "content_abcdef0123");
        assert_eq!(key.target_extension(), ".h5ad");
        assert!(SessionKey::content("../x", None).is_err());
        assert!(SessionKey::content("", None).is_err());
    }
}
