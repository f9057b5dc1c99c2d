//! Protocol constants: message types, close codes, and limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum WebSocket message size (4 MiB). Chunk payloads never ride the
/// JSON envelope, so control messages stay far below this.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// How long a client has to send its `auth` frame after connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the server waits for a `migration_ack` before aborting the
/// migration attempt.
pub const MIGRATION_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code: the client presented no credential at all.
pub const CLOSE_MISSING_CREDENTIAL: u16 = 4001;
/// Close code: the credential was present but invalid or expired.
pub const CLOSE_INVALID_CREDENTIAL: u16 = 4002;
/// Close code: the identity provider failed while authenticating.
pub const CLOSE_AUTH_ERROR: u16 = 4003;
/// Close code: a resource or rate limit rejected the connection. The close
/// reason carries a human-readable explanation.
pub const CLOSE_LIMIT_EXCEEDED: u16 = 4004;

/// All message types exchanged over a persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client -> server: bearer credential, must be the first frame.
    Auth,
    /// Server -> client: admission succeeded.
    AuthOk,
    /// Client -> server: pause/resume/retry/cancel an upload.
    UploadControl,
    /// Server -> client: outcome of an upload control request.
    UploadResult,
    /// Server -> client: periodic upload progress.
    UploadProgress,
    /// Server -> client: the connection is about to move to another node.
    MigrationStart,
    /// Client -> server: the client is ready to be moved.
    MigrationAck,
    /// Server -> client: the move finished.
    MigrationComplete,
    Ping,
    Pong,
    Error,
}
