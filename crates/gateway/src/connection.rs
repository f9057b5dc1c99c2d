//! Per-connection plumbing: write pump, read loop, message dispatch.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use stevedore_protocol::constants::MessageType;
use stevedore_protocol::envelope::Message;
use stevedore_protocol::messages::{MigrationAck, UploadControlRequest, UploadControlResult};
use stevedore_transfer::{TransferEngine, TransferError};

use crate::GatewayError;

/// Write-side handle for one admitted connection.
///
/// Cloneable; the read loop, the migration driver, and the progress
/// forwarder all send through the same pump.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) id: String,
    pub(crate) user_id: String,
    pub(crate) tenant_id: String,
    tx: mpsc::Sender<tungstenite::Message>,
    /// At most one migration handshake is pending per connection.
    pub(crate) pending_ack: Arc<Mutex<Option<oneshot::Sender<MigrationAck>>>>,
    pub(crate) cancel: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: String,
        user_id: String,
        tenant_id: String,
        tx: mpsc::Sender<tungstenite::Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            user_id,
            tenant_id,
            tx,
            pending_ack: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Serializes and queues an envelope for the write pump.
    pub(crate) async fn send(&self, msg: &Message) -> Result<(), GatewayError> {
        let json = serde_json::to_string(msg)?;
        self.tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

/// Forwards queued frames to the WebSocket sink until the channel closes or
/// the connection is cancelled.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = write.close().await;
}

/// Reads frames for an admitted connection and dispatches them.
///
/// Returns when the peer closes, the connection errors, or the server shuts
/// down. The caller owns all cleanup.
pub(crate) async fn read_loop<S>(
    mut read: S,
    handle: ConnectionHandle,
    engine: Arc<TransferEngine>,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,

            msg = read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let parsed: Message = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(connection = %handle.id, "unparseable frame: {e}");
                                continue;
                            }
                        };
                        dispatch(&parsed, &handle, &engine).await;
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        trace!(connection = %handle.id, "ws ping");
                        let _ = handle.tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        debug!(connection = %handle.id, "peer closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = %handle.id, "read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

async fn dispatch(msg: &Message, handle: &ConnectionHandle, engine: &Arc<TransferEngine>) {
    match msg.msg_type {
        MessageType::Ping => {
            if let Ok(pong) = msg.reply::<()>(MessageType::Pong, None) {
                let _ = handle.send(&pong).await;
            }
        }
        MessageType::UploadControl => {
            let reply = handle_upload_control(msg, engine).await;
            let _ = handle.send(&reply).await;
        }
        MessageType::MigrationAck => {
            let ack: MigrationAck = match msg.parse_payload() {
                Ok(Some(a)) => a,
                _ => {
                    warn!(connection = %handle.id, "migration_ack without payload");
                    return;
                }
            };
            if let Some(waiter) = handle.pending_ack.lock().await.take() {
                let _ = waiter.send(ack);
            } else {
                debug!(connection = %handle.id, "unsolicited migration_ack");
            }
        }
        other => {
            debug!(connection = %handle.id, ?other, "unexpected message type");
            let _ = handle
                .send(&msg.reply_error(400, format!("unexpected message type: {other:?}")))
                .await;
        }
    }
}

async fn handle_upload_control(msg: &Message, engine: &Arc<TransferEngine>) -> Message {
    let req: UploadControlRequest = match msg.parse_payload() {
        Ok(Some(r)) => r,
        Ok(None) => return msg.reply_error(400, "upload_control requires a payload"),
        Err(e) => return msg.reply_error(400, format!("invalid action: {e}")),
    };

    match engine.control_upload(&req.upload_id, req.action).await {
        Ok(status) => {
            let result = UploadControlResult {
                upload_id: req.upload_id,
                status,
            };
            msg.reply(MessageType::UploadResult, Some(&result))
                .unwrap_or_else(|e| msg.reply_error(500, e.to_string()))
        }
        Err(e @ TransferError::UploadNotFound(_)) => msg.reply_error(404, e.to_string()),
        Err(e @ TransferError::InvalidAction(_)) => msg.reply_error(400, e.to_string()),
        Err(e) => msg.reply_error(500, e.to_string()),
    }
}
