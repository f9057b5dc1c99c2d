//! Client-facing WebSocket gateway.
//!
//! Accepts connections, runs the admission handshake (first frame must be an
//! `auth` message), then serves the upload control surface and drives the
//! migration handshake for rebalance plans. Progress events published by the
//! transfer engine are forwarded to the connection that owns the upload.

mod connection;
mod server;

pub use server::{GatewayConfig, GatewayServer};

use stevedore_cluster::ClusterError;

/// Gateway failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The client never acknowledged a migration start; the attempt is
    /// abandoned with node state untouched.
    #[error("migration not acknowledged by {0}")]
    MigrationTimeout(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    CircuitOpen(#[from] stevedore_breaker::CircuitOpen),

    #[error("connection closed")]
    ConnectionClosed,
}
