// ==============================================================================
// merger.rs - Chunk Reassembly
// ==============================================================================
// Description: Index-ordered concatenation, content addressing, file recording
// Author: Matt Barham
// Created: 2026-10-13
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
//
// Steps:
//   1. Stream chunks 0..total into a temp file in the output directory,
//      feeding the same bytes to the hasher
//   2. Verify the written size against the session's accumulated size
//   3. Rename to <digest><ext> (or apply the duplicate policy)
//   4. Record the file entity
//   5. Remove staging (best-effort)
//
// Staging is left untouched on every failure before step 4. Under the
// reject policy a file published in step 3 is removed again if step 4
// fails, so a retry does not collide with its own output.
//
// ==============================================================================

use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::config::DuplicatePolicy;
use crate::error::{IngestError, Result};
use crate::hasher::IncrementalHasher;
use crate::models::{MergedFile, NewMergedFile, SessionKey};
use crate::repository::FileRepository;

#[derive(Clone)]
pub struct Merger {
    store: ChunkStore,
    files: Arc<dyn FileRepository>,
    policy: DuplicatePolicy,
}

impl Merger {
    pub fn new(store: ChunkStore, files: Arc<dyn FileRepository>, policy: DuplicatePolicy) -> Self {
        Self {
            store,
            files,
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Reassemble `total_chunks` staged chunks into one content-addressed file.
    /// `expected_size` is the byte count the session accumulated.
    pub async fn merge(
        &self,
        key: &SessionKey,
        total_chunks: u32,
        expected_size: u64,
    ) -> Result<MergedFile> {
        let upload_id = key.upload_id();
        let output_dir = self.store.output_dir(key);
        tokio::fs::create_dir_all(&output_dir).await?;

        let temp_path = output_dir.join(format!(".merge_{}_{}", upload_id, Uuid::new_v4()));
        let (digest, written) = match self
            .write_ordered(key, total_chunks, &temp_path)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                remove_quietly(&temp_path).await;
                return Err(e);
            }
        };

        if written != expected_size {
            remove_quietly(&temp_path).await;
            return Err(IngestError::IncompleteUpload {
                upload_id,
                reason: format!(
                    "merged {} bytes but session received {} bytes",
                    written, expected_size
                ),
                missing_index: None,
            });
        }

        let final_path = output_dir.join(format!("{}{}", digest, key.target_extension()));
        let published = if tokio::fs::try_exists(&final_path).await? {
            remove_quietly(&temp_path).await;
            match self.policy {
                DuplicatePolicy::Reuse => {
                    info!("Content {} already stored, reusing {:?}", digest, final_path);
                }
                DuplicatePolicy::Reject => {
                    return Err(IngestError::DuplicateContent { digest });
                }
            }
            false
        } else {
            if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
                remove_quietly(&temp_path).await;
                return Err(e.into());
            }
            true
        };

        let inserted = self
            .files
            .insert_file(NewMergedFile {
                project_id: key.project_id(),
                user_id: key.user_id(),
                file_name: key.logical_name(),
                file_path: final_path.to_string_lossy().to_string(),
                file_size: written,
                digest,
            })
            .await;
        let file = match inserted {
            Ok(file) => file,
            Err(e) => {
                if published && self.policy == DuplicatePolicy::Reject {
                    remove_quietly(&final_path).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.remove_staging(key).await {
            warn!("Failed to remove staging for {}: {}", upload_id, e);
        }

        info!(
            "Merged {} chunks for {} into {} ({} bytes)",
            total_chunks, upload_id, file.file_path, file.file_size
        );
        Ok(file)
    }

    async fn write_ordered(
        &self,
        key: &SessionKey,
        total_chunks: u32,
        temp_path: &Path,
    ) -> Result<(String, u64)> {
        let mut output = tokio::fs::File::create(temp_path).await?;
        let mut hasher = IncrementalHasher::new();

        for index in 0..total_chunks {
            let data = self.store.read_chunk(key, index).await?.ok_or_else(|| {
                IngestError::IncompleteUpload {
                    upload_id: key.upload_id(),
                    reason: format!("chunk {} is missing from staging", index),
                    missing_index: Some(index),
                }
            })?;

            hasher.update(&data);
            output.write_all(&data).await?;
        }

        output.flush().await?;
        output.sync_all().await?;

        let written = hasher.bytes_hashed();
        Ok((hasher.finalize_hex(), written))
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temporary file {:?}: {}", path, e);
        }
    }
}
