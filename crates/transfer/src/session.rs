//! Per-upload session state.
//!
//! All mutation goes through one async mutex so concurrent chunk completions
//! serialize their read-modify-write of the progress counters.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use stevedore_protocol::messages::ProgressEvent;
use stevedore_protocol::types::{Principal, UploadStatus};
use stevedore_store::BlobTarget;

use crate::chunk::{ChunkState, ChunkStatus};
use crate::progress::SpeedCalculator;
use crate::TransferError;

struct SessionInner {
    chunks: BTreeMap<u32, ChunkState>,
    status: UploadStatus,
    paused: bool,
    cancelled: bool,
    uploaded_bytes: u64,
    total_bytes: u64,
    chunks_completed: u32,
    error: Option<String>,
    updated_at: Instant,
}

/// One file transfer in progress.
pub struct UploadSession {
    id: String,
    principal: Principal,
    source: PathBuf,
    target: BlobTarget,
    /// Sanitized original file name.
    file_name: String,
    content_type: String,
    /// Local temporary copy to delete on teardown, if the caller staged one.
    temp_copy: Option<PathBuf>,
    started_at: Instant,
    inner: Mutex<SessionInner>,
    resume_notify: Notify,
    speed: SpeedCalculator,
}

impl UploadSession {
    pub(crate) fn new(
        id: String,
        principal: Principal,
        source: PathBuf,
        target: BlobTarget,
        file_name: String,
        content_type: String,
        temp_copy: Option<PathBuf>,
        total_bytes: u64,
        chunks: Vec<ChunkState>,
    ) -> Self {
        Self {
            id,
            principal,
            source,
            target,
            file_name,
            content_type,
            temp_copy,
            started_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                chunks: chunks.into_iter().map(|c| (c.index, c)).collect(),
                status: UploadStatus::Initializing,
                paused: false,
                cancelled: false,
                uploaded_bytes: 0,
                total_bytes,
                chunks_completed: 0,
                error: None,
                updated_at: Instant::now(),
            }),
            resume_notify: Notify::new(),
            speed: SpeedCalculator::new(None, None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn source(&self) -> &PathBuf {
        &self.source
    }

    pub fn target(&self) -> &BlobTarget {
        &self.target
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub(crate) fn temp_copy(&self) -> Option<&PathBuf> {
        self.temp_copy.as_ref()
    }

    pub async fn status(&self) -> UploadStatus {
        self.inner.lock().await.status
    }

    pub async fn total_bytes(&self) -> u64 {
        self.inner.lock().await.total_bytes
    }

    pub async fn uploaded_bytes(&self) -> u64 {
        self.inner.lock().await.uploaded_bytes
    }

    /// Time since the last state change.
    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.updated_at.elapsed()
    }

    pub(crate) async fn set_status(&self, status: UploadStatus) {
        let mut s = self.inner.lock().await;
        // A pause issued before the run loop switches into Uploading must
        // survive it, or resume would be rejected while the chunk tasks
        // stay parked on the flag.
        if status == UploadStatus::Uploading && s.paused {
            s.status = UploadStatus::Paused;
        } else {
            s.status = status;
        }
        s.updated_at = Instant::now();
    }

    /// Marks the session paused; the chunk loop observes the flag at its
    /// next checkpoint.
    pub async fn pause(&self) {
        let mut s = self.inner.lock().await;
        s.paused = true;
        s.status = UploadStatus::Paused;
        s.updated_at = Instant::now();
    }

    /// Clears the pause flag and wakes waiting chunk tasks.
    pub async fn resume(&self) {
        let mut s = self.inner.lock().await;
        s.paused = false;
        if s.status == UploadStatus::Paused {
            s.status = UploadStatus::Uploading;
        }
        s.updated_at = Instant::now();
        drop(s);
        self.resume_notify.notify_waiters();
    }

    /// Flags the session cancelled and wakes any paused waiters so they can
    /// observe the flag.
    pub async fn cancel(&self) {
        let mut s = self.inner.lock().await;
        s.cancelled = true;
        s.status = UploadStatus::Cancelled;
        s.updated_at = Instant::now();
        drop(s);
        self.resume_notify.notify_waiters();
    }

    pub async fn is_cancelled(&self) -> bool {
        self.inner.lock().await.cancelled
    }

    /// Resets failed chunks to pending so a new run can retry them.
    pub async fn reset_failed_chunks(&self) {
        let mut s = self.inner.lock().await;
        for chunk in s.chunks.values_mut() {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.attempts = 0;
            }
        }
        s.error = None;
        s.cancelled = false;
        s.status = UploadStatus::Initializing;
        s.updated_at = Instant::now();
    }

    /// Blocks while the session is paused. Returns an error once cancelled.
    ///
    /// Re-checks the flags on a short cadence as well as on notification,
    /// so a wake delivered between the check and the wait cannot strand a
    /// chunk task.
    pub async fn wait_while_paused(&self) -> Result<(), TransferError> {
        loop {
            {
                let s = self.inner.lock().await;
                if s.cancelled {
                    return Err(TransferError::Cancelled);
                }
                if !s.paused {
                    return Ok(());
                }
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                self.resume_notify.notified(),
            )
            .await;
        }
    }

    /// Records a successfully staged chunk: block id, counters, speed sample.
    ///
    /// `uploaded_bytes` is clamped to `total_bytes`; the counters only ever
    /// grow.
    pub async fn complete_chunk(&self, index: u32, block_id: String) {
        let mut s = self.inner.lock().await;
        if let Some(chunk) = s.chunks.get_mut(&index) {
            if chunk.status == ChunkStatus::Completed {
                return; // Idempotent; a resumed run may re-report a chunk.
            }
            chunk.status = ChunkStatus::Completed;
            chunk.block_id = Some(block_id);
            let len = chunk.len;
            s.uploaded_bytes = (s.uploaded_bytes + len).min(s.total_bytes);
            s.chunks_completed += 1;
            s.updated_at = Instant::now();
            self.speed.add_sample(len);
        }
    }

    pub(crate) async fn mark_chunk_uploading(&self, index: u32) {
        let mut s = self.inner.lock().await;
        if let Some(chunk) = s.chunks.get_mut(&index) {
            chunk.status = ChunkStatus::Uploading;
            chunk.attempts += 1;
        }
        s.updated_at = Instant::now();
    }

    pub(crate) async fn mark_chunk_failed(&self, index: u32) {
        let mut s = self.inner.lock().await;
        if let Some(chunk) = s.chunks.get_mut(&index) {
            chunk.status = ChunkStatus::Failed;
        }
        s.updated_at = Instant::now();
    }

    pub(crate) async fn fail(&self, error: &TransferError) {
        let mut s = self.inner.lock().await;
        s.status = UploadStatus::Failed;
        s.error = Some(error.to_string());
        s.updated_at = Instant::now();
    }

    /// Snapshot of chunks that still need staging. Chunks whose range lies
    /// below `resume_offset` are marked completed with their deterministic
    /// block id instead of being re-staged.
    pub(crate) async fn pending_chunks(&self, resume_offset: u64) -> Vec<ChunkState> {
        let mut s = self.inner.lock().await;
        let mut pending = Vec::new();
        let mut skipped_bytes = 0u64;
        let mut skipped_count = 0u32;
        for chunk in s.chunks.values_mut() {
            if chunk.status == ChunkStatus::Completed {
                continue;
            }
            if chunk.end() <= resume_offset {
                chunk.status = ChunkStatus::Completed;
                chunk.block_id = Some(crate::engine::block_id(chunk.index));
                skipped_bytes += chunk.len;
                skipped_count += 1;
                continue;
            }
            pending.push(chunk.clone());
        }
        s.uploaded_bytes = (s.uploaded_bytes + skipped_bytes).min(s.total_bytes);
        s.chunks_completed += skipped_count;
        pending
    }

    /// Ordered block ids, available only once every chunk completed.
    pub(crate) async fn block_list(&self) -> Option<Vec<String>> {
        let s = self.inner.lock().await;
        let mut blocks = Vec::with_capacity(s.chunks.len());
        for chunk in s.chunks.values() {
            blocks.push(chunk.block_id.clone()?);
        }
        Some(blocks)
    }

    /// Highest completed chunk index, if any chunk completed.
    pub async fn last_successful_chunk(&self) -> Option<u32> {
        let s = self.inner.lock().await;
        s.chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.index)
            .max()
    }

    /// Builds a progress event from the current counters.
    pub async fn progress(&self) -> ProgressEvent {
        let s = self.inner.lock().await;
        let progress = if s.total_bytes == 0 {
            100.0
        } else {
            (s.uploaded_bytes as f64 / s.total_bytes as f64) * 100.0
        };
        let throughput = self.speed.bytes_per_second();
        let remaining = s.total_bytes.saturating_sub(s.uploaded_bytes);
        ProgressEvent {
            upload_id: self.id.clone(),
            user_id: self.principal.user_id.clone(),
            tenant_id: self.principal.tenant_id.clone(),
            progress,
            chunks_completed: s.chunks_completed,
            total_chunks: s.chunks.len() as u32,
            uploaded_bytes: s.uploaded_bytes,
            total_bytes: s.total_bytes,
            status: s.status,
            eta_secs: self.speed.eta(remaining).map(|d| d.as_secs_f64()),
            throughput_bps: throughput,
            timestamp: String::new(),
        }
        .stamped_now()
    }
}
