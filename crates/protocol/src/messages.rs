//! Typed payloads carried inside the message envelope.

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, UploadAction, UploadStatus};

// ---------------------------------------------------------------------------
// Admission handshake
// ---------------------------------------------------------------------------

/// First frame a client must send: its bearer credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub token: String,
}

/// Reply when admission succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOk {
    pub connection_id: String,
    pub node_id: NodeId,
}

// ---------------------------------------------------------------------------
// Upload control surface
// ---------------------------------------------------------------------------

/// Pause/resume/retry/cancel an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadControlRequest {
    pub upload_id: String,
    pub action: UploadAction,
}

/// Outcome of an upload control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadControlResult {
    pub upload_id: String,
    pub status: UploadStatus,
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Periodic progress report for one upload, published on the notification
/// channel and forwarded to the owning connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub upload_id: String,
    pub user_id: String,
    pub tenant_id: String,
    /// Completion percentage in `[0, 100]`.
    pub progress: f64,
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub status: UploadStatus,
    /// Estimated seconds remaining; absent while throughput is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    /// Current throughput in bytes per second.
    pub throughput_bps: f64,
    /// RFC 3339 timestamp of this sample.
    pub timestamp: String,
}

impl ProgressEvent {
    /// Stamps the event with the current UTC time.
    pub fn stamped_now(mut self) -> Self {
        self.timestamp = chrono::Utc::now().to_rfc3339();
        self
    }
}

// ---------------------------------------------------------------------------
// Connection migration handshake
// ---------------------------------------------------------------------------

/// Server -> client: prepare to move to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStart {
    pub to_node: NodeId,
}

/// Client -> server: ready to be moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationAck {
    pub node_id: NodeId,
}

/// Server -> client: the move finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationComplete {
    pub node_id: NodeId,
}
