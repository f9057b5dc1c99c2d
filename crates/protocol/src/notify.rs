//! Abstract notification channel for progress and lifecycle events.
//!
//! The transfer engine and load balancer publish typed events here instead
//! of talking to any concrete transport, so the gateway (or a test) decides
//! where events go.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Topic for upload progress events.
pub const TOPIC_UPLOAD_PROGRESS: &str = "upload:progress";
/// Topic for connection relocation events.
pub const TOPIC_CONNECTION_MOVED: &str = "connection:moved";
/// Topic for lease lifecycle events.
pub const TOPIC_LEASE: &str = "lease";

/// Publish/subscribe sink for core events.
pub trait Notifier: Send + Sync {
    /// Publishes `payload` on `topic`. Must not block and must not fail the
    /// caller; delivery is best-effort.
    fn publish(&self, topic: &str, payload: Value);
}

/// A notification with its topic, as delivered to a channel subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub payload: Value,
}

/// Notifier backed by a tokio mpsc channel.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    /// Creates a notifier and the receiving end for its notifications.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn publish(&self, topic: &str, payload: Value) {
        // try_send keeps publishers non-blocking; a full channel drops the
        // event rather than stalling an upload task.
        if let Err(e) = self.tx.try_send(Notification {
            topic: topic.to_string(),
            payload,
        }) {
            warn!(topic, "dropping notification: {e}");
        }
    }
}

/// Notifier that discards everything.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn publish(&self, _topic: &str, _payload: Value) {}
}
