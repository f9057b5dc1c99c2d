//! Resumable chunked-upload transfer engine.
//!
//! Splits a file into chunks, uploads them concurrently against the object
//! store under an exclusive write lease, tracks per-chunk and per-upload
//! progress, and commits the final block list. Pause, resume, retry, and
//! cancel are explicit commands; resuming skips chunks that already landed.

mod chunk;
mod engine;
mod progress;
mod session;

pub use chunk::{
    ChunkState, ChunkStatus, adaptive_chunk_size, concurrency_for, plan_chunks, sanitize_file_name,
};
pub use engine::{TransferConfig, TransferEngine, UploadRequest};
pub use progress::SpeedCalculator;
pub use session::UploadSession;

use stevedore_store::StoreError;

/// Default chunk size: 4 MiB. Larger files get larger chunks via
/// [`adaptive_chunk_size`].
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store rejected an operation for want of a lease; callers should
    /// reacquire rather than treat this as a plain upload failure.
    #[error("lease required: {0}")]
    LeaseRequired(String),

    #[error("chunk {chunk} failed after {attempts} attempts: {last_error}")]
    ChunkExhausted {
        chunk: u32,
        attempts: u32,
        last_error: String,
    },

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("upload already running: {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Lease(#[from] stevedore_lease::LeaseError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LeaseRequired(t) => TransferError::LeaseRequired(t),
            other => TransferError::Store(other),
        }
    }
}
