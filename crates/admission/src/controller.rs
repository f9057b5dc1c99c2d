//! The gate sequence and connection bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use uuid::Uuid;

use stevedore_breaker::CircuitBreaker;
use stevedore_cluster::LoadBalancer;
use stevedore_protocol::types::{NodeId, Principal};

use crate::traits::{AuthError, IdentityProvider, QuotaService, RateLimiter, UpgradePrompter};
use crate::Rejection;

/// Breaker names, one per gate.
pub(crate) const GATE_AUTH: &str = "admission.auth";
pub(crate) const GATE_QUOTA: &str = "admission.quota";
pub(crate) const GATE_RATE: &str = "admission.rate";

/// One admitted client connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub principal: Principal,
    pub node: NodeId,
}

/// Successful admission result, echoed to the client as `auth_ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub connection_id: String,
    pub node_id: NodeId,
}

/// Runs the admission gate sequence and owns the connection pools.
///
/// Pools are keyed by (user, tenant) so quota collaborators can be asked
/// about the right scope and disconnects clean up exactly one entry.
pub struct AdmissionController {
    identity: Arc<dyn IdentityProvider>,
    quota: Arc<dyn QuotaService>,
    rate: Arc<dyn RateLimiter>,
    upgrade: Option<Arc<dyn UpgradePrompter>>,
    breaker: Arc<CircuitBreaker>,
    balancer: Arc<LoadBalancer>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, ConnectionRecord>,
    pools: HashMap<(String, String), HashSet<String>>,
}

impl AdmissionController {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        quota: Arc<dyn QuotaService>,
        rate: Arc<dyn RateLimiter>,
        upgrade: Option<Arc<dyn UpgradePrompter>>,
        breaker: Arc<CircuitBreaker>,
        balancer: Arc<LoadBalancer>,
    ) -> Self {
        Self {
            identity,
            quota,
            rate,
            upgrade,
            breaker,
            balancer,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Runs the full gate sequence for one connection attempt.
    ///
    /// `authenticate → quota → rate → assign`; the first refusing gate wins
    /// and nothing is registered. Only a fully admitted connection appears
    /// in the pools and on a node.
    pub async fn admit(&self, token: Option<&str>) -> Result<Admitted, Rejection> {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(Rejection::missing_credential()),
        };

        let principal = self.authenticate(token).await?;
        self.check_quota(&principal).await?;
        self.check_rate(&principal).await?;

        let node_id = self
            .balancer
            .best_node(principal.tier)
            .map_err(|e| {
                warn!(user = %principal.user_id, "no node available: {e}");
                Rejection::limit_exceeded("Resource limit exceeded")
            })?;

        let connection_id = Uuid::new_v4().to_string();
        self.balancer
            .register_connection(node_id, &connection_id, principal.tier)
            .map_err(|e| {
                warn!(connection = %connection_id, "node registration failed: {e}");
                Rejection::limit_exceeded("Resource limit exceeded")
            })?;

        let record = ConnectionRecord {
            id: connection_id.clone(),
            principal: principal.clone(),
            node: node_id,
        };
        {
            let mut state = self.state.lock().unwrap();
            state
                .pools
                .entry((principal.user_id.clone(), principal.tenant_id.clone()))
                .or_default()
                .insert(connection_id.clone());
            state.connections.insert(connection_id.clone(), record);
        }

        info!(
            connection = %connection_id,
            user = %principal.user_id,
            tenant = %principal.tenant_id,
            node = node_id,
            "connection admitted"
        );
        Ok(Admitted {
            connection_id,
            node_id,
        })
    }

    async fn authenticate(&self, token: &str) -> Result<Principal, Rejection> {
        self.guard(GATE_AUTH)?;
        match self.identity.authenticate(token).await {
            Ok(principal) => {
                self.breaker.record_success(GATE_AUTH);
                Ok(principal)
            }
            Err(AuthError::InvalidCredential(reason)) => {
                // The backend answered; only the credential is bad.
                self.breaker.record_success(GATE_AUTH);
                info!("credential rejected: {reason}");
                Err(Rejection::invalid_credential())
            }
            Err(AuthError::Backend(reason)) => {
                self.breaker.record_error(GATE_AUTH);
                warn!("identity backend failed: {reason}");
                Err(Rejection::auth_error("Authentication error"))
            }
        }
    }

    async fn check_quota(&self, principal: &Principal) -> Result<(), Rejection> {
        self.guard(GATE_QUOTA)?;
        match self.quota.allow_upload(principal).await {
            Ok(true) => {
                self.breaker.record_success(GATE_QUOTA);
                Ok(())
            }
            Ok(false) => {
                self.breaker.record_success(GATE_QUOTA);
                if let Some(upgrade) = &self.upgrade {
                    upgrade.offer_upgrade(principal).await;
                }
                Err(Rejection::limit_exceeded("Resource limit exceeded"))
            }
            Err(reason) => {
                self.breaker.record_error(GATE_QUOTA);
                warn!("quota backend failed: {reason}");
                Err(Rejection::unavailable())
            }
        }
    }

    async fn check_rate(&self, principal: &Principal) -> Result<(), Rejection> {
        self.guard(GATE_RATE)?;
        match self.rate.allow_connection(principal).await {
            Ok(true) => {
                self.breaker.record_success(GATE_RATE);
                Ok(())
            }
            Ok(false) => {
                self.breaker.record_success(GATE_RATE);
                Err(Rejection::limit_exceeded("Rate limit exceeded"))
            }
            Err(reason) => {
                self.breaker.record_error(GATE_RATE);
                warn!("rate limiter failed: {reason}");
                Err(Rejection::unavailable())
            }
        }
    }

    fn guard(&self, gate: &str) -> Result<(), Rejection> {
        self.breaker.guard(gate).map_err(|e| {
            warn!("gate {gate} behind open circuit: {e}");
            Rejection::unavailable()
        })
    }

    /// Unregisters a connection everywhere: node, pool, record map.
    pub fn disconnect(&self, connection_id: &str) {
        let record = {
            let mut state = self.state.lock().unwrap();
            let record = state.connections.remove(connection_id);
            if let Some(r) = &record {
                let key = (r.principal.user_id.clone(), r.principal.tenant_id.clone());
                if let Some(pool) = state.pools.get_mut(&key) {
                    pool.remove(connection_id);
                    if pool.is_empty() {
                        state.pools.remove(&key);
                    }
                }
            }
            record
        };
        if let Some(r) = record {
            self.balancer.unregister_connection(connection_id);
            info!(connection = %connection_id, user = %r.principal.user_id, "connection closed");
        }
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionRecord> {
        self.state.lock().unwrap().connections.get(connection_id).cloned()
    }

    /// Live connections for one (user, tenant) pool.
    pub fn pool_size(&self, user_id: &str, tenant_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pools
            .get(&(user_id.to_string(), tenant_id.to_string()))
            .map(|p| p.len())
            .unwrap_or(0)
    }
}
