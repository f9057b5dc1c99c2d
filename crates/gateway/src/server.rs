//! The gateway server: accept loop, admission handshake, migration driver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chrono::Utc;

use stevedore_admission::AdmissionController;
use stevedore_breaker::CircuitBreaker;
use stevedore_cluster::{LoadBalancer, MigrationPlan, ScalingDecision};
use stevedore_protocol::constants::{
    CLOSE_MISSING_CREDENTIAL, HANDSHAKE_TIMEOUT, MIGRATION_ACK_TIMEOUT, MessageType,
    WS_MAX_MESSAGE_SIZE,
};
use stevedore_protocol::envelope::Message;
use stevedore_protocol::messages::{AuthOk, AuthRequest, MigrationComplete, MigrationStart};
use stevedore_protocol::notify::{Notification, TOPIC_UPLOAD_PROGRESS};
use stevedore_transfer::TransferEngine;

use crate::GatewayError;
use crate::connection::{ConnectionHandle, read_loop, write_pump};

/// Breaker gate guarding the migration handshake.
const GATE_MIGRATE: &str = "cluster.migrate";

/// Outbound frames queued per connection before backpressure applies.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

/// The client-facing WebSocket server.
///
/// Every accepted socket must authenticate with its first frame; admitted
/// connections are tracked here so migration and progress fan-out can reach
/// them by connection id.
pub struct GatewayServer {
    config: GatewayConfig,
    admission: Arc<AdmissionController>,
    engine: Arc<TransferEngine>,
    balancer: Arc<LoadBalancer>,
    breaker: Arc<CircuitBreaker>,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        admission: Arc<AdmissionController>,
        engine: Arc<TransferEngine>,
        balancer: Arc<LoadBalancer>,
        breaker: Arc<CircuitBreaker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            admission,
            engine,
            balancer,
            breaker,
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), GatewayError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("gateway listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("gateway shutting down");
                    for handle in self.connections.lock().await.values() {
                        handle.close();
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one socket, runs the admission handshake, and serves the
    /// connection until it closes.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut write, mut read) = ws_stream.split();

        // First frame must be auth, within the handshake window.
        let auth_msg = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next()).await {
            Err(_) => {
                debug!(%peer_addr, "handshake timeout");
                let frame = tungstenite::protocol::CloseFrame {
                    code: CLOSE_MISSING_CREDENTIAL.into(),
                    reason: "authentication timeout".into(),
                };
                let _ = write.send(tungstenite::Message::Close(Some(frame))).await;
                return Err(GatewayError::HandshakeTimeout);
            }
            Ok(None) | Ok(Some(Err(_))) => return Err(GatewayError::ConnectionClosed),
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                serde_json::from_str::<Message>(&text)
                    .map_err(|e| GatewayError::Protocol(format!("bad handshake frame: {e}")))?
            }
            Ok(Some(Ok(_))) => {
                return Err(GatewayError::Protocol("expected a text auth frame".into()));
            }
        };

        let token = if auth_msg.msg_type == MessageType::Auth {
            auth_msg
                .parse_payload::<AuthRequest>()
                .ok()
                .flatten()
                .map(|a| a.token)
        } else {
            None
        };

        let admitted = match self.admission.admit(token.as_deref()).await {
            Ok(a) => a,
            Err(rejection) => {
                info!(%peer_addr, code = rejection.code, reason = %rejection.reason, "connection rejected");
                let frame = tungstenite::protocol::CloseFrame {
                    code: rejection.code.into(),
                    reason: rejection.reason.into(),
                };
                let _ = write.send(tungstenite::Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        let record = self
            .admission
            .connection(&admitted.connection_id)
            .ok_or_else(|| GatewayError::ConnectionNotFound(admitted.connection_id.clone()))?;

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let conn_cancel = self.cancel.child_token();
        let handle = ConnectionHandle::new(
            admitted.connection_id.clone(),
            record.principal.user_id.clone(),
            record.principal.tenant_id.clone(),
            tx,
            conn_cancel.clone(),
        );
        tokio::spawn(write_pump(write, rx, conn_cancel));
        self.connections
            .lock()
            .await
            .insert(handle.id.clone(), handle.clone());

        let auth_ok = AuthOk {
            connection_id: admitted.connection_id.clone(),
            node_id: admitted.node_id,
        };
        handle
            .send(&auth_msg.reply(MessageType::AuthOk, Some(&auth_ok))?)
            .await?;
        info!(%peer_addr, connection = %handle.id, node = admitted.node_id, "connection established");

        read_loop(read, handle.clone(), Arc::clone(&self.engine)).await;

        handle.close();
        self.connections.lock().await.remove(&handle.id);
        self.admission.disconnect(&handle.id);
        Ok(())
    }

    /// Executes one migration plan against its live connection.
    ///
    /// Sends `migration_start` and waits up to the ack timeout. Only an ack
    /// moves the connection in the balancer and emits `migration_complete`;
    /// a timeout abandons the attempt without touching node state.
    pub async fn migrate(self: &Arc<Self>, plan: MigrationPlan) -> Result<(), GatewayError> {
        self.breaker.guard(GATE_MIGRATE)?;

        let handle = self
            .connections
            .lock()
            .await
            .get(&plan.connection)
            .cloned()
            .ok_or_else(|| GatewayError::ConnectionNotFound(plan.connection.clone()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        *handle.pending_ack.lock().await = Some(ack_tx);

        let start = Message::new(
            Uuid::new_v4().to_string(),
            MessageType::MigrationStart,
            Some(&MigrationStart { to_node: plan.to }),
        )?;
        handle.send(&start).await?;

        let ack = match tokio::time::timeout(MIGRATION_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(ack)) => ack,
            _ => {
                // Drop the stale waiter so a later ack is not misread.
                handle.pending_ack.lock().await.take();
                self.breaker.record_error(GATE_MIGRATE);
                warn!(connection = %plan.connection, "migration ack timeout, aborting");
                return Err(GatewayError::MigrationTimeout(plan.connection));
            }
        };
        debug!(connection = %plan.connection, from_node = ack.node_id, "migration acknowledged");

        self.balancer
            .move_connection(&plan.connection, plan.from, plan.to)
            .inspect_err(|_| self.breaker.record_error(GATE_MIGRATE))?;

        let complete = Message::new(
            Uuid::new_v4().to_string(),
            MessageType::MigrationComplete,
            Some(&MigrationComplete { node_id: plan.to }),
        )?;
        handle.send(&complete).await?;
        self.breaker.record_success(GATE_MIGRATE);
        info!(connection = %plan.connection, from = plan.from, to = plan.to, "migration complete");
        Ok(())
    }

    /// Forwards transfer-engine notifications to the connections that own
    /// them. Runs until the channel closes or the server shuts down.
    pub fn spawn_progress_forwarder(self: &Arc<Self>, mut rx: mpsc::Receiver<Notification>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    n = rx.recv() => match n {
                        Some(n) => n,
                        None => break,
                    },
                };
                if notification.topic != TOPIC_UPLOAD_PROGRESS {
                    continue;
                }
                let Some(user_id) = notification.payload.get("userId").and_then(|v| v.as_str())
                else {
                    continue;
                };

                let targets: Vec<ConnectionHandle> = server
                    .connections
                    .lock()
                    .await
                    .values()
                    .filter(|h| h.user_id == user_id)
                    .cloned()
                    .collect();
                for handle in targets {
                    let msg = match Message::new(
                        Uuid::new_v4().to_string(),
                        MessageType::UploadProgress,
                        Some(&notification.payload),
                    ) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("progress forward failed: {e}");
                            continue;
                        }
                    };
                    let _ = handle.send(&msg).await;
                }
            }
        });
    }

    /// Periodic coordination loop: re-evaluates scaling and drives one
    /// rebalance migration per tick, on the cluster health-check interval.
    pub fn spawn_coordinator(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let interval = self.balancer.config().health_check_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    _ = tick.tick() => server.coordinate().await,
                }
            }
        });
    }

    async fn coordinate(self: &Arc<Self>) {
        match self.balancer.evaluate_scaling(Utc::now()) {
            ScalingDecision::ScaleUp => info!("cluster load high and rising, scaling up"),
            ScalingDecision::ScaleDown => info!("cluster load low and falling, scaling down"),
            ScalingDecision::Hold => {}
        }
        match self.balancer.create_rebalance_plan() {
            Ok(Some(plan)) => {
                if let Err(e) = self.migrate(plan).await {
                    warn!("rebalance migration failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!("rebalance not applicable: {e}"),
        }
    }
}
