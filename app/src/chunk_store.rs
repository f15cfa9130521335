// ==============================================================================
// chunk_store.rs - Chunk Staging Storage
// ==============================================================================
// Description: Per-session staging directories addressed by chunk index
// Author: Matt Barham
// Created: 2026-10-13
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
//
// Layout under the upload root:
//
//   <root>/chunks/<upload_id>/chunk_<index>   staged chunk bytes
//   <root>/<output_subdir>/<digest><ext>      published merged files
//
// Chunk files are written to a `.part` sibling first and renamed into place,
// so a chunk path either holds the complete bytes or does not exist.
//
// ==============================================================================

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::Result;
use crate::models::SessionKey;

const STAGING_DIR: &str = "chunks";

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory owned by one upload session
    pub fn staging_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(STAGING_DIR).join(key.upload_id())
    }

    pub fn chunk_path(&self, key: &SessionKey, index: u32) -> PathBuf {
        self.staging_dir(key).join(format!("chunk_{:06}", index))
    }

    /// Directory that receives the merged output for this key
    pub fn output_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.output_subdir())
    }

    /// Persist one chunk. The staging directory is created on demand.
    pub async fn write_chunk(&self, key: &SessionKey, index: u32, data: &[u8]) -> Result<()> {
        let dir = self.staging_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = self.chunk_path(key, index);
        let part_path = final_path.with_extension("part");

        let mut file = tokio::fs::File::create(&part_path).await?;
        if let Err(e) = write_and_sync(&mut file, data).await {
            drop(file);
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e.into());
        }
        drop(file);

        tokio::fs::rename(&part_path, &final_path).await?;
        debug!("Staged chunk {} for {} ({} bytes)", index, key, data.len());
        Ok(())
    }

    /// Read a staged chunk; `None` when it is not on disk
    pub async fn read_chunk(&self, key: &SessionKey, index: u32) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.chunk_path(key, index)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a session's staging directory. A missing directory is not an error.
    pub async fn remove_staging(&self, key: &SessionKey) -> Result<()> {
        match tokio::fs::remove_dir_all(self.staging_dir(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_and_sync(file: &mut tokio::fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}
