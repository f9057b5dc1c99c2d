//! Object-store abstraction used by the transfer engine and lease manager.
//!
//! The remote store exposes stage/commit-block semantics and lease
//! primitives; this crate defines the trait the core orchestrates against
//! plus an in-memory implementation for tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub mod mem;

/// Boxed future returned by [`BlobStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors surfaced by a blob store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The operation requires a valid lease and none (or the wrong one) was
    /// presented. Distinct so callers can trigger reacquisition instead of
    /// treating it as a generic I/O failure.
    #[error("lease required for {0}")]
    LeaseRequired(String),

    /// A lease is already held by another writer.
    #[error("lease conflict on {0}")]
    LeaseConflict(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch staging block {0}")]
    ChecksumMismatch(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Address of one blob in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobTarget {
    pub container: String,
    pub key: String,
}

impl BlobTarget {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for BlobTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// Lease state reported by [`BlobStore::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Available,
    Leased,
}

/// Result of probing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProps {
    pub exists: bool,
    pub lease_state: LeaseState,
}

/// Metadata attached to a committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Sanitized original file name (non-printable characters stripped).
    pub file_name: String,
    pub content_type: String,
    pub content_length: u64,
}

impl BlobMetadata {
    /// Content-Disposition header value derived from the file name.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.file_name)
    }
}

/// External blob store with stage/commit-block semantics and leases.
///
/// Dyn-compatible: methods return boxed futures so services hold an
/// `Arc<dyn BlobStore>` and tests substitute fakes.
pub trait BlobStore: Send + Sync {
    /// Reports whether the blob exists and whether a lease is held on it.
    fn probe<'a>(&'a self, target: &'a BlobTarget) -> StoreFuture<'a, BlobProps>;

    /// Acquires an exclusive write lease. Fails with [`StoreError::LeaseConflict`]
    /// if another writer holds one.
    fn acquire_lease<'a>(
        &'a self,
        target: &'a BlobTarget,
        duration: Duration,
    ) -> StoreFuture<'a, String>;

    /// Extends the expiry of an existing lease.
    fn renew_lease<'a>(&'a self, target: &'a BlobTarget, lease_id: &'a str)
    -> StoreFuture<'a, ()>;

    /// Releases a held lease.
    fn release_lease<'a>(
        &'a self,
        target: &'a BlobTarget,
        lease_id: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Forcibly clears any lease on the blob, whoever holds it.
    fn break_lease<'a>(&'a self, target: &'a BlobTarget) -> StoreFuture<'a, ()>;

    /// Stages one block of data under the given lease. `checksum` is the
    /// hex SHA-256 of `data`; an empty string skips verification.
    fn stage_block<'a>(
        &'a self,
        target: &'a BlobTarget,
        block_id: &'a str,
        data: Vec<u8>,
        checksum: &'a str,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()>;

    /// Commits the ordered block list, materializing the blob with the given
    /// metadata. Single shot; the caller orders blocks by chunk sequence.
    fn commit_block_list<'a>(
        &'a self,
        target: &'a BlobTarget,
        block_ids: &'a [String],
        metadata: &'a BlobMetadata,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()>;
}

/// Computes the hex SHA-256 digest of a block.
pub fn block_checksum(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
