//! In-memory [`BlobStore`] with scriptable failures.
//!
//! Faithful enough for the engine and lease tests: leases expire, staging
//! verifies checksums, commit assembles blocks in the order given, and the
//! failure-injection counters let a test fail the next N calls of an
//! operation to exercise retry and reacquire paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::{
    BlobMetadata, BlobProps, BlobStore, BlobTarget, LeaseState, StoreError, StoreFuture,
    block_checksum,
};

#[derive(Debug, Clone)]
struct HeldLease {
    id: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct BlobEntry {
    staged: HashMap<String, Vec<u8>>,
    committed: Option<(Vec<u8>, BlobMetadata)>,
    lease: Option<HeldLease>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<BlobTarget, BlobEntry>,
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_stages: AtomicU32,
    fail_renewals: AtomicU32,
    fail_acquires: AtomicU32,
    fail_commits: AtomicU32,
    fail_releases: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` stage calls with a backend error.
    pub fn fail_next_stages(&self, n: u32) {
        self.fail_stages.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` renew calls.
    pub fn fail_next_renewals(&self, n: u32) {
        self.fail_renewals.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` acquire calls.
    pub fn fail_next_acquires(&self, n: u32) {
        self.fail_acquires.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` commit calls.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` release calls.
    pub fn fail_next_releases(&self, n: u32) {
        self.fail_releases.store(n, Ordering::SeqCst);
    }

    /// Pre-seeds a lease on a blob, simulating an abandoned writer.
    pub fn seed_lease(&self, target: &BlobTarget, ttl: Duration) -> String {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.blobs.entry(target.clone()).or_default();
        let id = uuid::Uuid::new_v4().to_string();
        entry.lease = Some(HeldLease {
            id: id.clone(),
            expires_at: Instant::now() + ttl,
        });
        id
    }

    /// Returns the committed bytes and metadata, if the blob was committed.
    pub fn committed(&self, target: &BlobTarget) -> Option<(Vec<u8>, BlobMetadata)> {
        let inner = self.inner.lock().unwrap();
        inner.blobs.get(target).and_then(|e| e.committed.clone())
    }

    /// Number of staged (uncommitted) blocks for a blob.
    pub fn staged_blocks(&self, target: &BlobTarget) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.blobs.get(target).map(|e| e.staged.len()).unwrap_or(0)
    }

    /// Returns the currently held lease id, if any (expired leases excluded).
    pub fn lease_id(&self, target: &BlobTarget) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .blobs
            .get(target)
            .and_then(|e| e.lease.as_ref())
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.id.clone())
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Checks that `lease_id` satisfies any live lease on the entry.
    fn check_lease(entry: &BlobEntry, target: &BlobTarget, lease_id: Option<&str>) -> Result<(), StoreError> {
        let live = entry
            .lease
            .as_ref()
            .filter(|l| l.expires_at > Instant::now());
        match live {
            None => Ok(()),
            Some(held) if lease_id == Some(held.id.as_str()) => Ok(()),
            Some(_) => Err(StoreError::LeaseRequired(target.to_string())),
        }
    }
}

impl BlobStore for MemoryStore {
    fn probe<'a>(&'a self, target: &'a BlobTarget) -> StoreFuture<'a, BlobProps> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            let entry = inner.blobs.get(target);
            let leased = entry
                .and_then(|e| e.lease.as_ref())
                .is_some_and(|l| l.expires_at > Instant::now());
            Ok(BlobProps {
                exists: entry.is_some_and(|e| e.committed.is_some()),
                lease_state: if leased {
                    LeaseState::Leased
                } else {
                    LeaseState::Available
                },
            })
        })
    }

    fn acquire_lease<'a>(
        &'a self,
        target: &'a BlobTarget,
        duration: Duration,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            if Self::take_injected(&self.fail_acquires) {
                return Err(StoreError::Backend("injected acquire failure".into()));
            }
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.blobs.entry(target.clone()).or_default();
            if let Some(held) = &entry.lease
                && held.expires_at > Instant::now()
            {
                return Err(StoreError::LeaseConflict(target.to_string()));
            }
            let id = uuid::Uuid::new_v4().to_string();
            entry.lease = Some(HeldLease {
                id: id.clone(),
                expires_at: Instant::now() + duration,
            });
            Ok(id)
        })
    }

    fn renew_lease<'a>(
        &'a self,
        target: &'a BlobTarget,
        lease_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if Self::take_injected(&self.fail_renewals) {
                return Err(StoreError::Backend("injected renew failure".into()));
            }
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .blobs
                .get_mut(target)
                .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
            match &mut entry.lease {
                Some(held) if held.id == lease_id => {
                    held.expires_at = Instant::now() + Duration::from_secs(60);
                    Ok(())
                }
                _ => Err(StoreError::LeaseRequired(target.to_string())),
            }
        })
    }

    fn release_lease<'a>(
        &'a self,
        target: &'a BlobTarget,
        lease_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if Self::take_injected(&self.fail_releases) {
                return Err(StoreError::Backend("injected release failure".into()));
            }
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .blobs
                .get_mut(target)
                .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
            match &entry.lease {
                Some(held) if held.id == lease_id => {
                    entry.lease = None;
                    Ok(())
                }
                _ => Err(StoreError::LeaseRequired(target.to_string())),
            }
        })
    }

    fn break_lease<'a>(&'a self, target: &'a BlobTarget) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.blobs.get_mut(target) {
                entry.lease = None;
            }
            Ok(())
        })
    }

    fn stage_block<'a>(
        &'a self,
        target: &'a BlobTarget,
        block_id: &'a str,
        data: Vec<u8>,
        checksum: &'a str,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if Self::take_injected(&self.fail_stages) {
                return Err(StoreError::Backend("injected stage failure".into()));
            }
            if !checksum.is_empty() && block_checksum(&data) != checksum {
                return Err(StoreError::ChecksumMismatch(block_id.to_string()));
            }
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.blobs.entry(target.clone()).or_default();
            Self::check_lease(entry, target, lease_id)?;
            entry.staged.insert(block_id.to_string(), data);
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        target: &'a BlobTarget,
        block_ids: &'a [String],
        metadata: &'a BlobMetadata,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if Self::take_injected(&self.fail_commits) {
                return Err(StoreError::Backend("injected commit failure".into()));
            }
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .blobs
                .get_mut(target)
                .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
            Self::check_lease(entry, target, lease_id)?;

            let mut assembled = Vec::new();
            for id in block_ids {
                let block = entry
                    .staged
                    .get(id)
                    .ok_or_else(|| StoreError::Backend(format!("unknown block id {id}")))?;
                assembled.extend_from_slice(block);
            }
            entry.committed = Some((assembled, metadata.clone()));
            entry.staged.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> BlobTarget {
        BlobTarget::new("uploads", "t1/file.bin")
    }

    fn meta(len: u64) -> BlobMetadata {
        BlobMetadata {
            file_name: "file.bin".into(),
            content_type: "application/octet-stream".into(),
            content_length: len,
        }
    }

    #[tokio::test]
    async fn stage_and_commit_assembles_in_order() {
        let store = MemoryStore::new();
        let t = target();
        store
            .stage_block(&t, "b-1", b"world".to_vec(), "", None)
            .await
            .unwrap();
        store
            .stage_block(&t, "b-0", b"hello ".to_vec(), "", None)
            .await
            .unwrap();

        let order = vec!["b-0".to_string(), "b-1".to_string()];
        store
            .commit_block_list(&t, &order, &meta(11), None)
            .await
            .unwrap();

        let (data, m) = store.committed(&t).unwrap();
        assert_eq!(&data, b"hello world");
        assert_eq!(m.content_length, 11);
        assert_eq!(store.staged_blocks(&t), 0);
    }

    #[tokio::test]
    async fn stage_verifies_checksum() {
        let store = MemoryStore::new();
        let t = target();
        let good = block_checksum(b"data");
        store
            .stage_block(&t, "b-0", b"data".to_vec(), &good, None)
            .await
            .unwrap();

        let err = store
            .stage_block(&t, "b-1", b"data".to_vec(), "deadbeef", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch(_)));
    }

    #[tokio::test]
    async fn acquire_conflicts_while_leased() {
        let store = MemoryStore::new();
        let t = target();
        let id = store
            .acquire_lease(&t, Duration::from_secs(60))
            .await
            .unwrap();
        let err = store
            .acquire_lease(&t, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseConflict(_)));
        assert_eq!(store.lease_id(&t), Some(id));
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let store = MemoryStore::new();
        let t = target();
        store
            .acquire_lease(&t, Duration::from_millis(0))
            .await
            .unwrap();
        // Immediately expired; acquisition should succeed.
        store
            .acquire_lease(&t, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn staging_without_lease_is_rejected_when_leased() {
        let store = MemoryStore::new();
        let t = target();
        let id = store
            .acquire_lease(&t, Duration::from_secs(60))
            .await
            .unwrap();

        let err = store
            .stage_block(&t, "b-0", b"x".to_vec(), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseRequired(_)));

        store
            .stage_block(&t, "b-0", b"x".to_vec(), "", Some(&id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn break_lease_clears_any_holder() {
        let store = MemoryStore::new();
        let t = target();
        store.seed_lease(&t, Duration::from_secs(600));
        store.break_lease(&t).await.unwrap();
        assert!(store.lease_id(&t).is_none());
        let props = store.probe(&t).await.unwrap();
        assert_eq!(props.lease_state, LeaseState::Available);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        let t = target();
        store.fail_next_stages(1);
        assert!(
            store
                .stage_block(&t, "b-0", b"x".to_vec(), "", None)
                .await
                .is_err()
        );
        assert!(
            store
                .stage_block(&t, "b-0", b"x".to_vec(), "", None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn commit_with_unknown_block_fails() {
        let store = MemoryStore::new();
        let t = target();
        store
            .stage_block(&t, "b-0", b"x".to_vec(), "", None)
            .await
            .unwrap();
        let order = vec!["b-0".to_string(), "b-missing".to_string()];
        let err = store
            .commit_block_list(&t, &order, &meta(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
