// ==============================================================================
// session.rs - Upload Sessions and Registry
// ==============================================================================
// Description: Per-key chunk bookkeeping, two-phase chunk submission, merge trigger
// Author: Matt Barham
// Created: 2026-10-13
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
//
// Locking:
//   - the registry map lock is held only to look up / insert / remove a session
//   - each session has its own lock, held only for bookkeeping
//   - chunk writes, merge I/O and repository calls run with no lock held
//
// A chunk submission claims its index (in_flight) under the session lock,
// writes without the lock, then re-locks to mark the index received. The
// merging flag is set under the same lock, so only one request merges.
// A resend of an in-flight index with the same bytes waits on `written`
// and is then answered like any other duplicate.
//
// ==============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chunk_store::ChunkStore;
use crate::config::UploadConfig;
use crate::error::{IngestError, Result};
use crate::hasher::digest_hex;
use crate::merger::Merger;
use crate::models::{ChunkOutcome, MergedFile, SessionKey, UploadStatus};
use crate::repository::FileRepository;
use crate::validator;

/// In-memory state for one in-flight upload
#[derive(Debug)]
pub struct UploadSession {
    key: SessionKey,
    total_chunks: u32,
    received: Vec<bool>,
    chunk_digests: Vec<Option<String>>,
    chunk_sizes: Vec<u64>,
    received_bytes: u64,
    in_flight: HashMap<u32, String>,
    written: Arc<Notify>,
    merging: bool,
    closed: bool,
    last_activity: Instant,
}

impl UploadSession {
    pub fn new(key: SessionKey, total_chunks: u32) -> Self {
        let len = total_chunks as usize;
        Self {
            key,
            total_chunks,
            received: vec![false; len],
            chunk_digests: vec![None; len],
            chunk_sizes: vec![0; len],
            received_bytes: 0,
            in_flight: HashMap::new(),
            written: Arc::new(Notify::new()),
            merging: false,
            closed: false,
            last_activity: Instant::now(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.received.iter().filter(|r| **r).count() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.received.get(index as usize).copied().unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    pub fn is_merging(&self) -> bool {
        self.merging
    }

    /// Floored percentage of chunks received
    pub fn progress_percent(&self) -> i32 {
        (u64::from(self.received_count()) * 100 / u64::from(self.total_chunks.max(1))) as i32
    }

    fn is_writing(&self, index: u32) -> bool {
        self.in_flight.contains_key(&index)
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn mark_received(&mut self, index: u32, size: u64, digest: String) {
        let i = index as usize;
        if !self.received[i] {
            self.received[i] = true;
            self.chunk_sizes[i] = size;
            self.chunk_digests[i] = Some(digest);
            self.received_bytes += size;
        }
    }

    /// Forget a chunk so the client can send it again
    fn clear(&mut self, index: u32) {
        let i = index as usize;
        if i < self.received.len() && self.received[i] {
            self.received[i] = false;
            self.received_bytes -= self.chunk_sizes[i];
            self.chunk_sizes[i] = 0;
            self.chunk_digests[i] = None;
        }
    }
}

type SharedSession = Arc<Mutex<UploadSession>>;

fn lock(session: &SharedSession) -> MutexGuard<'_, UploadSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decision taken under the session lock before any I/O
enum Admission {
    Duplicate,
    Write,
    Merge { total: u32, bytes: u64 },
    Wait(Arc<Notify>),
    Retry,
}

/// Owner of every in-flight upload session
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, SharedSession>>,
    store: ChunkStore,
    merger: Merger,
    files: Arc<dyn FileRepository>,
    max_chunk_bytes: usize,
}

impl SessionRegistry {
    pub fn new(config: &UploadConfig, files: Arc<dyn FileRepository>) -> Self {
        let store = ChunkStore::new(config.upload_root.clone());
        let merger = Merger::new(store.clone(), files.clone(), config.duplicate_policy);
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            merger,
            files,
            max_chunk_bytes: config.max_chunk_bytes,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn session_count(&self) -> usize {
        self.map().len()
    }

    /// Snapshot of (received, total) for a key
    pub fn session_progress(&self, key: &SessionKey) -> Option<(u32, u32)> {
        let session = self.map().get(key).cloned()?;
        let guard = lock(&session);
        Some((guard.received_count(), guard.total_chunks()))
    }

    fn map(&self) -> MutexGuard<'_, HashMap<SessionKey, SharedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existing session for `key`, or a new one sized to `total_chunks`
    fn session_for(&self, key: &SessionKey, total_chunks: u32) -> Result<SharedSession> {
        let mut map = self.map();
        if let Some(existing) = map.get(key) {
            let declared = lock(existing).total_chunks();
            if declared != total_chunks {
                return Err(IngestError::InvalidChunkMetadata(format!(
                    "upload {} declared {} chunks, this chunk declares {}",
                    key, declared, total_chunks
                )));
            }
            return Ok(existing.clone());
        }

        debug!("Opening upload session {} ({} chunks)", key, total_chunks);
        let session = Arc::new(Mutex::new(UploadSession::new(key.clone(), total_chunks)));
        map.insert(key.clone(), session.clone());
        Ok(session)
    }

    /// Drop `session` from the map if it is still the registered one
    fn detach(&self, key: &SessionKey, session: &SharedSession) {
        let mut map = self.map();
        if map.get(key).is_some_and(|current| Arc::ptr_eq(current, session)) {
            map.remove(key);
        }
        lock(session).closed = true;
    }

    /// Accept one chunk for `key`.
    ///
    /// Metadata is validated before any state exists, so a rejected chunk
    /// never creates a session. Re-sending stored bytes returns `Duplicate`;
    /// re-sending different bytes fails with `ChunkConflict`.
    pub async fn submit_chunk(
        &self,
        key: &SessionKey,
        index: u32,
        total_chunks: u32,
        data: &[u8],
    ) -> Result<ChunkOutcome> {
        validator::validate_chunk(index, total_chunks, data.len(), self.max_chunk_bytes)?;
        let digest = digest_hex(data);

        loop {
            let session = self.session_for(key, total_chunks)?;
            match Self::admit(&session, index, &digest)? {
                // session closed between lookup and lock; look it up again
                Admission::Retry => continue,
                Admission::Wait(written) => {
                    let notified = written.notified();
                    let writing = lock(&session).is_writing(index);
                    if writing {
                        debug!("Chunk {} of {} is being written; waiting", index, key);
                        notified.await;
                    }
                    continue;
                }
                Admission::Duplicate => {
                    debug!("Chunk {} of {} already stored", index, key);
                    return Ok(ChunkOutcome::Duplicate);
                }
                Admission::Merge { total, bytes } => {
                    return self.run_merge(key, &session, total, bytes).await;
                }
                Admission::Write => {
                    return self
                        .write_and_record(key, &session, index, data, digest)
                        .await;
                }
            }
        }
    }

    fn admit(session: &SharedSession, index: u32, digest: &str) -> Result<Admission> {
        let mut guard = lock(session);
        if guard.closed {
            return Ok(Admission::Retry);
        }
        guard.touch();

        if guard.is_received(index) {
            let same = guard.chunk_digests[index as usize].as_deref() == Some(digest);
            if !same {
                return Err(IngestError::ChunkConflict {
                    index,
                    reason: "index already holds different bytes".to_string(),
                });
            }
            // A completed session whose earlier merge failed is merged again
            // when the client re-sends any chunk.
            if guard.is_complete() && !guard.merging {
                guard.merging = true;
                return Ok(Admission::Merge {
                    total: guard.total_chunks,
                    bytes: guard.received_bytes,
                });
            }
            return Ok(Admission::Duplicate);
        }

        match guard.in_flight.get(&index) {
            Some(writing) if writing == digest => Ok(Admission::Wait(guard.written.clone())),
            Some(_) => Err(IngestError::ChunkConflict {
                index,
                reason: "chunk is being written by another request".to_string(),
            }),
            None => {
                guard.in_flight.insert(index, digest.to_string());
                Ok(Admission::Write)
            }
        }
    }

    async fn write_and_record(
        &self,
        key: &SessionKey,
        session: &SharedSession,
        index: u32,
        data: &[u8],
        digest: String,
    ) -> Result<ChunkOutcome> {
        if let Err(e) = self.store.write_chunk(key, index, data).await {
            let written = {
                let mut guard = lock(session);
                guard.in_flight.remove(&index);
                guard.written.clone()
            };
            written.notify_waiters();
            error!("Failed to stage chunk {} of {}: {}", index, key, e);
            return Err(e);
        }

        let (written, recorded) = {
            let mut guard = lock(session);
            guard.in_flight.remove(&index);
            let written = guard.written.clone();
            if guard.closed {
                (written, None)
            } else {
                guard.mark_received(index, data.len() as u64, digest);
                guard.touch();

                let merge = if guard.is_complete() && !guard.merging {
                    guard.merging = true;
                    Some(guard.received_bytes)
                } else {
                    None
                };
                let recorded = (
                    guard.received_count(),
                    guard.total_chunks,
                    guard.progress_percent(),
                    merge,
                );
                (written, Some(recorded))
            }
        };
        written.notify_waiters();

        let Some((received, total, percent, merge)) = recorded else {
            if let Err(e) = self.store.remove_staging(key).await {
                warn!("Failed to remove staging for closed upload {}: {}", key, e);
            }
            return Err(IngestError::ChunkConflict {
                index,
                reason: "upload session was closed while the chunk was written".to_string(),
            });
        };

        if let Some(bytes) = merge {
            return self.run_merge(key, session, total, bytes).await;
        }

        self.record_progress(key, UploadStatus::Uploading, percent).await;
        Ok(ChunkOutcome::Accepted { received, total })
    }

    async fn run_merge(
        &self,
        key: &SessionKey,
        session: &SharedSession,
        total: u32,
        bytes: u64,
    ) -> Result<ChunkOutcome> {
        self.record_progress(key, UploadStatus::Merging, 100).await;

        match self.merger.merge(key, total, bytes).await {
            Ok(file) => {
                self.detach(key, session);
                self.record_progress(key, UploadStatus::Completed, 100).await;
                Ok(ChunkOutcome::Completed(file))
            }
            Err(e) => {
                self.handle_merge_failure(key, session, &e).await;
                Err(e)
            }
        }
    }

    async fn handle_merge_failure(&self, key: &SessionKey, session: &SharedSession, e: &IngestError) {
        error!("Merge failed for {}: {}", key, e);

        match e {
            IngestError::DuplicateContent { .. } => {
                self.detach(key, session);
                if let Err(cleanup) = self.store.remove_staging(key).await {
                    warn!("Failed to remove staging for {}: {}", key, cleanup);
                }
                self.record_progress(key, UploadStatus::Failed, 100).await;
            }
            IngestError::IncompleteUpload { missing_index, .. } => {
                let percent = {
                    let mut guard = lock(session);
                    guard.merging = false;
                    if let Some(index) = missing_index {
                        guard.clear(*index);
                    }
                    guard.progress_percent()
                };
                self.record_progress(key, UploadStatus::Uploading, percent).await;
            }
            _ => {
                lock(session).merging = false;
                self.record_progress(key, UploadStatus::Failed, 100).await;
            }
        }
    }

    /// Upload progress rows are advisory; a failed write never fails the chunk
    async fn record_progress(&self, key: &SessionKey, status: UploadStatus, percent: i32) {
        if let Err(e) = self
            .files
            .record_upload_progress(&key.upload_id(), status, percent)
            .await
        {
            warn!("Failed to record upload progress for {}: {}", key, e);
        }
    }

    /// Remove a session and its staging directory. Returns false for unknown keys.
    pub async fn abandon(&self, key: &SessionKey) -> Result<bool> {
        let session = self.map().get(key).cloned();
        let Some(session) = session else {
            return Ok(false);
        };

        if lock(&session).merging {
            return Err(IngestError::ChunkConflict {
                index: 0,
                reason: "upload is being merged".to_string(),
            });
        }

        self.detach(key, &session);
        self.store.remove_staging(key).await?;
        self.record_progress(key, UploadStatus::Failed, 0).await;
        info!("Abandoned upload {}", key);
        Ok(true)
    }

    /// Drop sessions idle for at least `max_idle`, skipping merges in progress
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<(SessionKey, SharedSession)> = {
            let map = self.map();
            map.iter()
                .filter(|(_, session)| {
                    let guard = lock(session);
                    !guard.merging && guard.last_activity.elapsed() >= max_idle
                })
                .map(|(key, session)| (key.clone(), session.clone()))
                .collect()
        };

        let mut evicted = 0;
        for (key, session) in expired {
            {
                let guard = lock(&session);
                if guard.merging || guard.last_activity.elapsed() < max_idle {
                    continue;
                }
            }
            self.detach(&key, &session);
            if let Err(e) = self.store.remove_staging(&key).await {
                warn!("Failed to remove staging for evicted upload {}: {}", key, e);
            }
            evicted += 1;
        }

        if evicted > 0 {
            info!("Evicted {} idle upload session(s)", evicted);
        }
        evicted
    }
}

/// Convenience for callers that only need the merged file
pub fn completed_file(outcome: &ChunkOutcome) -> Option<&MergedFile> {
    match outcome {
        ChunkOutcome::Completed(file) => Some(file),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use crate::memory::MemoryRepository;
    use tempfile::TempDir;

    fn registry(policy: DuplicatePolicy) -> (TempDir, Arc<MemoryRepository>, SessionRegistry) {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let config = UploadConfig {
            upload_root: dir.path().to_path_buf(),
            duplicate_policy: policy,
            ..UploadConfig::default()
        };
        let registry = SessionRegistry::new(&config, repo.clone());
        (dir, repo, registry)
    }

    fn chunks() -> Vec<Vec<u8>> {
        vec![vec![b'a'; 1000], vec![b'b'; 1000], vec![b'c'; 500]]
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_completes_with_content_digest() {
        let (_dir, repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();
        let parts = chunks();

        let first = registry.submit_chunk(&key, 1, 3, &parts[1]).await.unwrap();
        assert_eq!(first, ChunkOutcome::Accepted { received: 1, total: 3 });

        let second = registry.submit_chunk(&key, 0, 3, &parts[0]).await.unwrap();
        assert_eq!(second, ChunkOutcome::Accepted { received: 2, total: 3 });
        assert_eq!(repo.upload_progress(&key.upload_id()).unwrap().progress, 66);

        let third = registry.submit_chunk(&key, 2, 3, &parts[2]).await.unwrap();
        let file = completed_file(&third).expect("completed");

        assert_eq!(file.file_size, 2500);
        assert_eq!(file.digest, digest_hex(&parts.concat()));
        assert_eq!(tokio::fs::read(&file.file_path).await.unwrap(), parts.concat());
        assert_eq!(registry.session_count(), 0);
        assert_eq!(
            repo.upload_progress(&key.upload_id()).unwrap().status,
            UploadStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_digest_is_independent_of_arrival_order() {
        let parts: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 64 + i as usize]).collect();
        let orders: [[u32; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];

        let mut digests = Vec::new();
        for order in orders {
            let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
            let key = SessionKey::project(1, 1, "perm.npy").unwrap();
            let mut last = None;
            for index in order {
                last = Some(
                    registry
                        .submit_chunk(&key, index, 4, &parts[index as usize])
                        .await
                        .unwrap(),
                );
            }
            let outcome = last.unwrap();
            let file = completed_file(&outcome).unwrap();
            assert_eq!(tokio::fs::read(&file.file_path).await.unwrap(), parts.concat());
            digests.push(file.digest.clone());
        }

        assert!(digests.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_noop() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();
        let parts = chunks();

        registry.submit_chunk(&key, 0, 3, &parts[0]).await.unwrap();
        let again = registry.submit_chunk(&key, 0, 3, &parts[0]).await.unwrap();
        assert_eq!(again, ChunkOutcome::Duplicate);
        assert_eq!(registry.session_progress(&key), Some((1, 3)));

        registry.submit_chunk(&key, 1, 3, &parts[1]).await.unwrap();
        let done = registry.submit_chunk(&key, 2, 3, &parts[2]).await.unwrap();
        assert_eq!(completed_file(&done).unwrap().file_size, 2500);
    }

    #[tokio::test]
    async fn test_conflicting_bytes_are_rejected() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();

        registry.submit_chunk(&key, 0, 2, b"original").await.unwrap();
        let err = registry.submit_chunk(&key, 0, 2, b"tampered").await.unwrap_err();

        assert!(matches!(err, IngestError::ChunkConflict { index: 0, .. }));
        let stored = registry.store().read_chunk(&key, 0).await.unwrap();
        assert_eq!(stored, Some(b"original".to_vec()));
    }

    #[tokio::test]
    async fn test_invalid_metadata_creates_no_session() {
        let (dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();

        let err = registry.submit_chunk(&key, 3, 3, b"x").await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidChunkMetadata(_)));
        assert!(registry.submit_chunk(&key, 0, 0, b"x").await.is_err());

        assert_eq!(registry.session_count(), 0);
        assert!(!dir.path().join("chunks").exists());
    }

    #[tokio::test]
    async fn test_total_mismatch_is_rejected() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();

        registry.submit_chunk(&key, 0, 3, b"x").await.unwrap();
        let err = registry.submit_chunk(&key, 1, 4, b"y").await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidChunkMetadata(_)));
        assert_eq!(registry.session_progress(&key), Some((1, 3)));
    }

    #[tokio::test]
    async fn test_missing_staged_chunk_can_be_resent() {
        let (_dir, repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();

        registry.submit_chunk(&key, 0, 2, b"left-").await.unwrap();
        tokio::fs::remove_file(registry.store().chunk_path(&key, 0))
            .await
            .unwrap();

        let err = registry.submit_chunk(&key, 1, 2, b"right").await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::IncompleteUpload { missing_index: Some(0), .. }
        ));
        assert!(registry.store().chunk_path(&key, 1).exists());
        assert!(repo.files().is_empty());

        let outcome = registry.submit_chunk(&key, 0, 2, b"left-").await.unwrap();
        assert_eq!(completed_file(&outcome).unwrap().digest, digest_hex(b"left-right"));
    }

    #[tokio::test]
    async fn test_reject_policy_surfaces_duplicate_content() {
        let (_dir, repo, registry) = registry(DuplicatePolicy::Reject);
        let first = SessionKey::project(7, 2, "a.h5").unwrap();
        let second = SessionKey::project(7, 3, "b.h5").unwrap();

        registry.submit_chunk(&first, 0, 1, b"identical").await.unwrap();
        let err = registry.submit_chunk(&second, 0, 1, b"identical").await.unwrap_err();

        assert!(matches!(err, IngestError::DuplicateContent { .. }));
        assert_eq!(repo.files().len(), 1);
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.store().staging_dir(&second).exists());
    }

    #[tokio::test]
    async fn test_concurrent_last_chunks_merge_once() {
        let (_dir, repo, registry) = registry(DuplicatePolicy::Reuse);
        let registry = Arc::new(registry);
        let key = SessionKey::project(9, 9, "race.npy").unwrap();
        registry.submit_chunk(&key, 0, 3, b"zero").await.unwrap();

        let a = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move { registry.submit_chunk(&key, 1, 3, b"one").await })
        };
        let b = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move { registry.submit_chunk(&key, 2, 3, b"two").await })
        };

        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let completed = outcomes.iter().filter(|o| completed_file(o).is_some()).count();

        assert_eq!(completed, 1);
        assert_eq!(repo.files().len(), 1);
    }

    #[tokio::test]
    async fn test_resend_during_write_waits_for_the_first_request() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let registry = Arc::new(registry);
        let key = SessionKey::project(4, 4, "slow.h5ad").unwrap();

        let session = registry.session_for(&key, 2).unwrap();
        assert!(matches!(
            SessionRegistry::admit(&session, 0, &digest_hex(b"first")).unwrap(),
            Admission::Write
        ));

        let resend = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move { registry.submit_chunk(&key, 0, 2, b"first").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!resend.is_finished());

        let other = registry.submit_chunk(&key, 0, 2, b"other").await.unwrap_err();
        assert!(matches!(other, IngestError::ChunkConflict { index: 0, .. }));

        let outcome = registry
            .write_and_record(&key, &session, 0, b"first", digest_hex(b"first"))
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Accepted { received: 1, total: 2 });

        assert_eq!(resend.await.unwrap().unwrap(), ChunkOutcome::Duplicate);
        assert_eq!(registry.session_progress(&key), Some((1, 2)));
    }

    #[tokio::test]
    async fn test_final_chunk_after_close_is_rejected_and_cleaned() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(5, 5, "closed.h5ad").unwrap();

        let session = registry.session_for(&key, 1).unwrap();
        assert!(matches!(
            SessionRegistry::admit(&session, 0, &digest_hex(b"late")).unwrap(),
            Admission::Write
        ));
        registry.detach(&key, &session);

        let err = registry
            .write_and_record(&key, &session, 0, b"late", digest_hex(b"late"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::ChunkConflict { index: 0, .. }));
        assert!(!registry.store().staging_dir(&key).exists());
        assert!(!lock(&session).is_writing(0));
    }

    #[tokio::test]
    async fn test_abandon_removes_state_and_staging() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let key = SessionKey::project(7, 2, "sample.h5ad").unwrap();
        registry.submit_chunk(&key, 0, 2, b"x").await.unwrap();

        assert!(registry.abandon(&key).await.unwrap());
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.store().staging_dir(&key).exists());
        assert!(!registry.abandon(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_sessions() {
        let (_dir, _repo, registry) = registry(DuplicatePolicy::Reuse);
        let stale = SessionKey::project(1, 1, "stale.h5").unwrap();
        let fresh = SessionKey::project(1, 1, "fresh.h5").unwrap();

        registry.submit_chunk(&stale, 0, 2, b"x").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        registry.submit_chunk(&fresh, 0, 2, b"y").await.unwrap();

        let evicted = registry.evict_idle(Duration::from_secs(60)).await;

        assert_eq!(evicted, 1);
        assert_eq!(registry.session_progress(&stale), None);
        assert_eq!(registry.session_progress(&fresh), Some((1, 2)));
        assert!(!registry.store().staging_dir(&stale).exists());
    }
}
