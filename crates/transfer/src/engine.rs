//! Upload orchestration: lease, chunk fan-out, commit.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stevedore_lease::LeaseManager;
use stevedore_protocol::messages::ProgressEvent;
use stevedore_protocol::notify::{Notifier, TOPIC_UPLOAD_PROGRESS};
use stevedore_protocol::types::{Principal, UploadAction, UploadStatus};
use stevedore_store::{BlobMetadata, BlobStore, BlobTarget, StoreError, block_checksum};

use crate::chunk::{ChunkState, adaptive_chunk_size, concurrency_for, plan_chunks, sanitize_file_name};
use crate::session::UploadSession;
use crate::TransferError;

/// Deterministic block id for a chunk index. Stable across runs so a resumed
/// upload can reference blocks staged by an earlier attempt.
pub(crate) fn block_id(index: u32) -> String {
    format!("block-{index:08}")
}

/// Transfer engine tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Fixed chunk size; `None` picks one from the file size.
    pub chunk_size: Option<u64>,
    /// Parallel chunk uploads; `None` picks a count from the file size.
    pub max_concurrency: Option<usize>,
    /// Total staging attempts allowed per chunk (floored at one).
    pub max_retries: u32,
    /// Base delay for exponential backoff between chunk retries.
    pub retry_base_delay: Duration,
    /// Interval between progress notifications while an upload runs.
    pub progress_interval: Duration,
    /// Sessions idle longer than this are dropped by [`TransferEngine::sweep_stale`].
    pub stale_after: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            max_concurrency: None,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            progress_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

impl TransferConfig {
    /// Reads overrides from `STEVEDORE_TRANSFER_CHUNK_SIZE` (bytes),
    /// `STEVEDORE_TRANSFER_MAX_RETRIES`, `STEVEDORE_TRANSFER_RETRY_BASE_MS`,
    /// and `STEVEDORE_TRANSFER_MAX_CONCURRENCY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("STEVEDORE_TRANSFER_CHUNK_SIZE") {
            if let Ok(n) = v.parse::<u64>() {
                if n > 0 {
                    config.chunk_size = Some(n);
                }
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_TRANSFER_MAX_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                config.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_TRANSFER_RETRY_BASE_MS") {
            if let Ok(n) = v.parse::<u64>() {
                config.retry_base_delay = Duration::from_millis(n);
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_TRANSFER_MAX_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    config.max_concurrency = Some(n);
                }
            }
        }
        config
    }
}

/// Parameters for a new upload.
pub struct UploadRequest {
    pub principal: Principal,
    /// Local file to read chunks from.
    pub source: PathBuf,
    pub container: String,
    /// Blob key within the container.
    pub key: String,
    /// Original file name, stored in the blob metadata after sanitization.
    pub file_name: String,
    pub content_type: String,
    /// Temporary copy of the source to delete once the upload finishes.
    pub temp_copy: Option<PathBuf>,
    /// Bytes already persisted by an earlier attempt; chunks entirely below
    /// this offset are not re-staged.
    pub resume_offset: u64,
}

/// Orchestrates chunked uploads against a [`BlobStore`].
///
/// Holds every in-flight session; the gateway routes control commands and
/// progress queries here by upload id.
pub struct TransferEngine {
    store: Arc<dyn BlobStore>,
    leases: Arc<LeaseManager>,
    notifier: Arc<dyn Notifier>,
    config: TransferConfig,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<UploadSession>>>,
    running: std::sync::Mutex<HashSet<String>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn BlobStore>,
        leases: Arc<LeaseManager>,
        notifier: Arc<dyn Notifier>,
        config: TransferConfig,
    ) -> Self {
        Self {
            store,
            leases,
            notifier,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            running: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Registers a new upload and returns its id.
    ///
    /// Plans the chunk layout from the file size; when `resume_offset` is
    /// set, chunks that already landed are marked complete up front.
    pub async fn begin(&self, req: UploadRequest) -> Result<String, TransferError> {
        let meta = tokio::fs::metadata(&req.source).await?;
        let total_bytes = meta.len();

        let chunk_size = self
            .config
            .chunk_size
            .unwrap_or_else(|| adaptive_chunk_size(total_bytes));
        let chunks = plan_chunks(total_bytes, chunk_size);
        let upload_id = Uuid::new_v4().to_string();
        let file_name = sanitize_file_name(&req.file_name);
        let target = BlobTarget::new(req.container, req.key);

        info!(
            upload = %upload_id,
            user = %req.principal.user_id,
            blob = %target,
            size = total_bytes,
            chunks = chunks.len(),
            "upload registered"
        );

        let session = Arc::new(UploadSession::new(
            upload_id.clone(),
            req.principal,
            req.source,
            target,
            file_name,
            req.content_type,
            req.temp_copy,
            total_bytes,
            chunks,
        ));
        if req.resume_offset > 0 {
            // Marks the already-landed chunks; the pending list is rebuilt
            // when the run starts.
            let skipped = session.pending_chunks(req.resume_offset).await;
            debug!(upload = %upload_id, remaining = skipped.len(), "resuming past earlier offset");
        }

        self.sessions
            .lock()
            .await
            .insert(upload_id.clone(), session);
        Ok(upload_id)
    }

    /// Runs an upload to completion: lease, stage all pending chunks with
    /// bounded concurrency, commit the block list, tear down.
    ///
    /// A failed run leaves the session in place so a `retry` command can
    /// pick it back up; cancellation and success remove it.
    pub async fn run(self: &Arc<Self>, upload_id: &str) -> Result<(), TransferError> {
        let session = self
            .session(upload_id)
            .await
            .ok_or_else(|| TransferError::UploadNotFound(upload_id.to_string()))?;

        {
            let mut running = self.running.lock().unwrap();
            if !running.insert(upload_id.to_string()) {
                return Err(TransferError::AlreadyRunning(upload_id.to_string()));
            }
        }
        let result = self.run_inner(&session).await;
        self.running.lock().unwrap().remove(upload_id);

        match &result {
            Ok(()) => {
                info!(upload = %upload_id, "upload completed");
                self.remove_session(&session).await;
            }
            Err(TransferError::Cancelled) => {
                info!(upload = %upload_id, "upload cancelled");
                self.publish_progress(&session).await;
                self.remove_session(&session).await;
            }
            Err(e) => {
                error!(upload = %upload_id, "upload failed: {e}");
                session.fail(e).await;
                self.publish_progress(&session).await;
                // Kept in the session map so a retry command can resume it;
                // the lease is released so another writer is not blocked.
                self.leases.cleanup(upload_id).await;
            }
        }
        result
    }

    async fn run_inner(self: &Arc<Self>, session: &Arc<UploadSession>) -> Result<(), TransferError> {
        let upload_id = session.id().to_string();
        self.leases.acquire(session.target(), &upload_id, true).await?;

        session.set_status(UploadStatus::Uploading).await;
        self.publish_progress(session).await;

        let ticker_cancel = CancellationToken::new();
        let ticker = {
            let engine = Arc::clone(self);
            let session = Arc::clone(session);
            let cancel = ticker_cancel.clone();
            let interval = self.config.progress_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await; // First tick completes immediately.
                loop {
                    tokio::select! {
                        _ = tick.tick() => engine.publish_progress(&session).await,
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        };

        let result = self.stage_all(session).await;
        ticker_cancel.cancel();
        let _ = ticker.await;
        result?;

        self.commit(session).await?;
        session.set_status(UploadStatus::Completed).await;
        self.publish_progress(session).await;
        Ok(())
    }

    async fn stage_all(self: &Arc<Self>, session: &Arc<UploadSession>) -> Result<(), TransferError> {
        let pending = session.pending_chunks(0).await;
        if pending.is_empty() {
            return Ok(());
        }

        let pending_bytes: u64 = pending.iter().map(|c| c.len).sum();
        let concurrency = self
            .config
            .max_concurrency
            .unwrap_or_else(|| concurrency_for(pending_bytes));
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks: JoinSet<Result<(), TransferError>> = JoinSet::new();

        for chunk in pending {
            // Acquire before spawning so at most `concurrency` chunk tasks
            // are in flight, rather than all tasks racing for permits.
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let engine = Arc::clone(self);
            let session = Arc::clone(session);
            tasks.spawn(async move {
                let _permit = permit;
                session.wait_while_paused().await?;
                engine.upload_chunk(&session, chunk).await
            });
        }

        let mut first_err: Option<TransferError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(r) => r,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(TransferError::Io(std::io::Error::other(e))),
            };
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                    tasks.abort_all();
                }
            }
        }

        if session.is_cancelled().await {
            return Err(TransferError::Cancelled);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stages one chunk with exponential backoff, delay doubling per failed
    /// attempt from `retry_base_delay`.
    async fn upload_chunk(
        &self,
        session: &Arc<UploadSession>,
        chunk: ChunkState,
    ) -> Result<(), TransferError> {
        // The configured value bounds total attempts, not retries on top of
        // the first try.
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                debug!(
                    upload = %session.id(),
                    chunk = chunk.index,
                    attempt,
                    ?delay,
                    "retrying chunk"
                );
                tokio::time::sleep(delay).await;
            }
            session.wait_while_paused().await?;
            session.mark_chunk_uploading(chunk.index).await;

            let data = read_range(session.source().clone(), chunk.offset, chunk.len).await?;
            let checksum = block_checksum(&data);
            let bid = block_id(chunk.index);
            let lease_id = self.leases.lease_id(session.id());

            match self
                .store
                .stage_block(session.target(), &bid, data, &checksum, lease_id.as_deref())
                .await
            {
                Ok(()) => {
                    session.complete_chunk(chunk.index, bid).await;
                    return Ok(());
                }
                // Lease loss is not retryable here; the renewal loop owns
                // reacquisition and the whole run fails fast.
                Err(StoreError::LeaseRequired(t)) => {
                    session.mark_chunk_failed(chunk.index).await;
                    return Err(TransferError::LeaseRequired(t));
                }
                Err(e) => {
                    warn!(upload = %session.id(), chunk = chunk.index, "chunk attempt failed: {e}");
                    last_error = e.to_string();
                    session.mark_chunk_failed(chunk.index).await;
                }
            }
        }

        Err(TransferError::ChunkExhausted {
            chunk: chunk.index,
            attempts,
            last_error,
        })
    }

    async fn commit(&self, session: &Arc<UploadSession>) -> Result<(), TransferError> {
        let blocks = session
            .block_list()
            .await
            .ok_or_else(|| TransferError::UploadNotFound(session.id().to_string()))?;
        let metadata = BlobMetadata {
            file_name: session.file_name().to_string(),
            content_type: session.content_type().to_string(),
            content_length: session.total_bytes().await,
        };
        let lease_id = self.leases.lease_id(session.id());
        self.store
            .commit_block_list(session.target(), &blocks, &metadata, lease_id.as_deref())
            .await?;
        debug!(upload = %session.id(), blocks = blocks.len(), "block list committed");
        Ok(())
    }

    /// Applies a pause/resume/retry/cancel command.
    ///
    /// Returns the session status after the command took effect. Commands
    /// that do not apply to the current status yield
    /// [`TransferError::InvalidAction`].
    pub async fn control_upload(
        self: &Arc<Self>,
        upload_id: &str,
        action: UploadAction,
    ) -> Result<UploadStatus, TransferError> {
        let session = self
            .session(upload_id)
            .await
            .ok_or_else(|| TransferError::UploadNotFound(upload_id.to_string()))?;
        let status = session.status().await;

        match action {
            UploadAction::Pause => {
                if !status.is_active() {
                    return Err(TransferError::InvalidAction(format!(
                        "cannot pause upload in status {status}"
                    )));
                }
                session.pause().await;
            }
            UploadAction::Resume => {
                if status != UploadStatus::Paused {
                    return Err(TransferError::InvalidAction(format!(
                        "cannot resume upload in status {status}"
                    )));
                }
                session.resume().await;
            }
            UploadAction::Retry => {
                if status != UploadStatus::Failed {
                    return Err(TransferError::InvalidAction(format!(
                        "cannot retry upload in status {status}"
                    )));
                }
                session.reset_failed_chunks().await;
                let engine = Arc::clone(self);
                let id = upload_id.to_string();
                tokio::spawn(async move {
                    let _ = engine.run(&id).await;
                });
            }
            UploadAction::Cancel => {
                session.cancel().await;
                let running = self.running.lock().unwrap().contains(upload_id);
                if !running {
                    // No run loop to observe the flag; tear down here.
                    self.remove_session(&session).await;
                }
            }
        }
        Ok(session.status().await)
    }

    pub async fn session(&self, upload_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.lock().await.get(upload_id).cloned()
    }

    /// Progress snapshot for one upload.
    pub async fn progress(&self, upload_id: &str) -> Option<ProgressEvent> {
        let session = self.session(upload_id).await?;
        Some(session.progress().await)
    }

    /// Ids of sessions not yet in a terminal status.
    pub async fn active_uploads(&self) -> Vec<String> {
        let sessions: Vec<Arc<UploadSession>> =
            self.sessions.lock().await.values().cloned().collect();
        let mut active = Vec::new();
        for s in sessions {
            if s.status().await.is_active() {
                active.push(s.id().to_string());
            }
        }
        active
    }

    /// Spawns the periodic staleness sweep, running until cancellation.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => engine.sweep_stale().await,
                }
            }
        });
    }

    /// Drops sessions that have not changed state within `stale_after`,
    /// releasing any lease they still hold. Safe to call on a timer.
    pub async fn sweep_stale(&self) {
        let candidates: Vec<Arc<UploadSession>> =
            self.sessions.lock().await.values().cloned().collect();
        for session in candidates {
            if self.running.lock().unwrap().contains(session.id()) {
                continue;
            }
            if session.idle_for().await >= self.config.stale_after {
                warn!(upload = %session.id(), "dropping stale upload session");
                self.remove_session(&session).await;
            }
        }
    }

    async fn remove_session(&self, session: &Arc<UploadSession>) {
        self.leases.cleanup(session.id()).await;
        self.sessions.lock().await.remove(session.id());
        if let Some(path) = session.temp_copy() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(upload = %session.id(), "failed to remove temp copy: {e}");
                }
            }
        }
    }

    async fn publish_progress(&self, session: &Arc<UploadSession>) {
        let event = session.progress().await;
        match serde_json::to_value(&event) {
            Ok(v) => self.notifier.publish(TOPIC_UPLOAD_PROGRESS, v),
            Err(e) => warn!(upload = %session.id(), "progress serialization failed: {e}"),
        }
    }
}

/// Reads `len` bytes at `offset` from `path` on the blocking pool.
async fn read_range(path: PathBuf, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
    let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use stevedore_lease::LeaseConfig;
    use stevedore_protocol::notify::{ChannelNotifier, NullNotifier};
    use stevedore_protocol::types::SubscriptionTier;
    use stevedore_store::mem::MemoryStore;

    fn principal() -> Principal {
        Principal {
            user_id: "user-1".into(),
            tenant_id: "tenant-1".into(),
            tier: SubscriptionTier::Standard,
        }
    }

    fn write_source(dir: &tempfile::TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("source.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&data).unwrap();
        path
    }

    fn fast_lease_config() -> LeaseConfig {
        LeaseConfig {
            duration: Duration::from_millis(500),
            renewal_buffer: Duration::from_millis(250),
            settle_delay: Duration::from_millis(5),
        }
    }

    fn engine_with(
        store: Arc<MemoryStore>,
        notifier: Arc<dyn Notifier>,
        config: TransferConfig,
    ) -> Arc<TransferEngine> {
        let leases = Arc::new(LeaseManager::new(
            store.clone() as Arc<dyn BlobStore>,
            fast_lease_config(),
        ));
        Arc::new(TransferEngine::new(store, leases, notifier, config))
    }

    fn request(source: PathBuf) -> UploadRequest {
        UploadRequest {
            principal: principal(),
            source,
            container: "uploads".into(),
            key: "tenant-1/source.bin".into(),
            file_name: "source.bin".into(),
            content_type: "application/octet-stream".into(),
            temp_copy: None,
            resume_offset: 0,
        }
    }

    fn small_chunks() -> TransferConfig {
        TransferConfig {
            chunk_size: Some(32 * 1024),
            retry_base_delay: Duration::from_millis(5),
            ..TransferConfig::default()
        }
    }

    #[test]
    fn config_from_env_reads_backoff_and_concurrency() {
        unsafe {
            std::env::set_var("STEVEDORE_TRANSFER_RETRY_BASE_MS", "25");
            std::env::set_var("STEVEDORE_TRANSFER_MAX_CONCURRENCY", "2");
        }
        let config = TransferConfig::from_env();
        unsafe {
            std::env::remove_var("STEVEDORE_TRANSFER_RETRY_BASE_MS");
            std::env::remove_var("STEVEDORE_TRANSFER_MAX_CONCURRENCY");
        }
        assert_eq!(config.retry_base_delay, Duration::from_millis(25));
        assert_eq!(config.max_concurrency, Some(2));
    }

    #[tokio::test]
    async fn uploads_and_commits_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 100 * 1024);
        let expected = std::fs::read(&source).unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), Arc::new(NullNotifier), small_chunks());

        let id = engine.begin(request(source)).await.unwrap();
        engine.run(&id).await.unwrap();

        let target = BlobTarget::new("uploads", "tenant-1/source.bin");
        let (bytes, meta) = store.committed(&target).unwrap();
        assert_eq!(bytes, expected);
        assert_eq!(meta.file_name, "source.bin");
        assert_eq!(meta.content_length, 100 * 1024);
        // Session and lease torn down on success.
        assert!(engine.session(&id).await.is_none());
        assert!(store.lease_id(&target).is_none());
    }

    #[tokio::test]
    async fn progress_events_reach_completion() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 64 * 1024);

        let store = Arc::new(MemoryStore::new());
        let (notifier, mut rx) = ChannelNotifier::new(256);
        let engine = engine_with(store, Arc::new(notifier), small_chunks());

        let id = engine.begin(request(source)).await.unwrap();
        engine.run(&id).await.unwrap();

        let mut last = None;
        while let Ok(n) = rx.try_recv() {
            assert_eq!(n.topic, TOPIC_UPLOAD_PROGRESS);
            last = Some(n.payload);
        }
        let last = last.expect("at least one progress event");
        assert_eq!(last["status"], "completed");
        assert_eq!(last["progress"], 100.0);
        assert_eq!(last["userId"], "user-1");
    }

    #[tokio::test]
    async fn transient_stage_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 40 * 1024);

        let store = Arc::new(MemoryStore::new());
        store.fail_next_stages(1);
        let engine = engine_with(store.clone(), Arc::new(NullNotifier), small_chunks());

        let id = engine.begin(request(source)).await.unwrap();
        engine.run(&id).await.unwrap();
        assert!(store.committed(&BlobTarget::new("uploads", "tenant-1/source.bin")).is_some());
    }

    #[tokio::test]
    async fn failing_chunk_is_attempted_exactly_max_retries_times() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 10 * 1024);

        let store = Arc::new(MemoryStore::new());
        store.fail_next_stages(100);
        let config = TransferConfig {
            chunk_size: Some(32 * 1024),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(5),
            ..TransferConfig::default()
        };
        let engine = engine_with(store.clone(), Arc::new(NullNotifier), config);

        let id = engine.begin(request(source)).await.unwrap();
        let err = engine.run(&id).await.unwrap_err();
        assert!(matches!(err, TransferError::ChunkExhausted { chunk: 0, attempts: 3, .. }));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_keep_session_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 10 * 1024);

        let store = Arc::new(MemoryStore::new());
        // One chunk, both allowed attempts failing.
        store.fail_next_stages(2);
        let config = TransferConfig {
            chunk_size: Some(32 * 1024),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            ..TransferConfig::default()
        };
        let engine = engine_with(store.clone(), Arc::new(NullNotifier), config);

        let id = engine.begin(request(source)).await.unwrap();
        let err = engine.run(&id).await.unwrap_err();
        assert!(matches!(err, TransferError::ChunkExhausted { chunk: 0, attempts: 2, .. }));
        assert!(store.committed(&BlobTarget::new("uploads", "tenant-1/source.bin")).is_none());

        let session = engine.session(&id).await.expect("failed session retained");
        assert_eq!(session.status().await, UploadStatus::Failed);

        // Injectors are spent; a retry command drives it to completion.
        let status = engine.control_upload(&id, UploadAction::Retry).await.unwrap();
        assert!(status.is_active());
        for _ in 0..100 {
            if engine.session(&id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.committed(&BlobTarget::new("uploads", "tenant-1/source.bin")).is_some());
    }

    #[tokio::test]
    async fn control_rejects_mismatched_actions() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 1024);

        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store, Arc::new(NullNotifier), small_chunks());
        let id = engine.begin(request(source)).await.unwrap();

        // Not paused, so resume is invalid; retry needs a failed session.
        let err = engine.control_upload(&id, UploadAction::Resume).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidAction(_)));
        let err = engine.control_upload(&id, UploadAction::Retry).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidAction(_)));

        let err = engine
            .control_upload("nope", UploadAction::Pause)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_before_run_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 1024);

        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store, Arc::new(NullNotifier), small_chunks());
        let id = engine.begin(request(source)).await.unwrap();

        let status = engine.control_upload(&id, UploadAction::Cancel).await.unwrap();
        assert_eq!(status, UploadStatus::Cancelled);
        assert!(engine.session(&id).await.is_none());
    }

    #[tokio::test]
    async fn pause_blocks_run_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 64 * 1024);

        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), Arc::new(NullNotifier), small_chunks());
        let id = engine.begin(request(source)).await.unwrap();

        engine.control_upload(&id, UploadAction::Pause).await.unwrap();
        let runner = {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move { engine.run(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.is_finished());
        assert_eq!(store.staged_blocks(&BlobTarget::new("uploads", "tenant-1/source.bin")), 0);
        // The run loop must not clobber the paused status, or the resume
        // below would be rejected as an invalid action.
        let session = engine.session(&id).await.unwrap();
        assert_eq!(session.status().await, UploadStatus::Paused);

        engine.control_upload(&id, UploadAction::Resume).await.unwrap();
        runner.await.unwrap().unwrap();
        assert!(store.committed(&BlobTarget::new("uploads", "tenant-1/source.bin")).is_some());
    }

    #[tokio::test]
    async fn resume_offset_skips_already_staged_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 64 * 1024);
        let expected = std::fs::read(&source).unwrap();

        let store = Arc::new(MemoryStore::new());
        let target = BlobTarget::new("uploads", "tenant-1/source.bin");
        // First chunk staged by an earlier attempt.
        store
            .stage_block(&target, &block_id(0), expected[..32 * 1024].to_vec(), "", None)
            .await
            .unwrap();

        let engine = engine_with(store.clone(), Arc::new(NullNotifier), small_chunks());
        let mut req = request(source);
        req.resume_offset = 32 * 1024;
        let id = engine.begin(req).await.unwrap();
        engine.run(&id).await.unwrap();

        let (bytes, _) = store.committed(&target).unwrap();
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn sweep_drops_idle_sessions_and_releases_leases() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 1024);

        let store = Arc::new(MemoryStore::new());
        let config = TransferConfig {
            stale_after: Duration::from_millis(20),
            ..small_chunks()
        };
        let engine = engine_with(store, Arc::new(NullNotifier), config);
        let id = engine.begin(request(source)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        engine.sweep_stale().await;
        assert!(engine.session(&id).await.is_none());
    }

    #[tokio::test]
    async fn temp_copy_removed_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, 4096);
        let temp = dir.path().join("staged-copy.bin");
        std::fs::copy(&source, &temp).unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store, Arc::new(NullNotifier), small_chunks());
        let mut req = request(source);
        req.temp_copy = Some(temp.clone());
        let id = engine.begin(req).await.unwrap();
        engine.run(&id).await.unwrap();
        assert!(!temp.exists());
    }
}
