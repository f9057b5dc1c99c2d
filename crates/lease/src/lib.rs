//! Exclusive write-lease management.
//!
//! Guarantees single-writer access to a remote blob for the duration of a
//! transfer: acquisition force-breaks abandoned leases, a background task
//! renews well before expiry, and renewal failures fall back to a
//! break-and-reacquire before giving up. Failures inside the renewal task
//! are converted to events so the owning transfer decides whether to abort.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stevedore_store::{BlobStore, BlobTarget, LeaseState, StoreError};

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("no lease held for {0}")]
    NotHeld(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lease lifecycle events, broadcast to interested owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Acquired {
        tracking_id: String,
        lease_id: String,
    },
    Renewed {
        tracking_id: String,
        lease_id: String,
    },
    /// Renewal failed but break-and-reacquire recovered with a fresh lease.
    Reacquired {
        tracking_id: String,
        lease_id: String,
    },
    /// Renewal and reacquire both failed; the lease is lost.
    Failed {
        tracking_id: String,
        reason: String,
    },
    Released {
        tracking_id: String,
    },
}

/// Lease timing configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Fixed lease duration requested from the store.
    pub duration: Duration,
    /// Renew this long before expiry. Half the duration by default, an
    /// aggressive buffer that tolerates slow renewal round-trips.
    pub renewal_buffer: Duration,
    /// Wait after force-breaking a lease before acquiring a fresh one.
    pub settle_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            renewal_buffer: Duration::from_secs(30),
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl LeaseConfig {
    /// Reads overrides from `STEVEDORE_LEASE_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = read_env_u64("STEVEDORE_LEASE_DURATION_SECS") {
            cfg.duration = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env_u64("STEVEDORE_LEASE_RENEWAL_BUFFER_SECS") {
            cfg.renewal_buffer = Duration::from_secs(secs);
        }
        cfg
    }

    fn renew_interval(&self) -> Duration {
        self.duration
            .saturating_sub(self.renewal_buffer)
            .max(Duration::from_millis(10))
    }
}

fn read_env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

struct Held {
    lease_id: String,
    target: BlobTarget,
    expires_at: Instant,
    renew_cancel: Option<CancellationToken>,
}

struct State {
    store: Arc<dyn BlobStore>,
    config: LeaseConfig,
    leases: Mutex<HashMap<String, Held>>,
    /// Tracking ids with a cleanup in progress, so concurrent renewal and
    /// cleanup cannot race into a double release.
    cleaning: Mutex<HashSet<String>>,
    events: broadcast::Sender<LeaseEvent>,
}

/// Acquires, renews, and releases exclusive write leases keyed by the
/// transfer's tracking id.
pub struct LeaseManager {
    state: Arc<State>,
    /// Serializes acquisition so concurrent acquires for one tracking id
    /// never yield two simultaneously valid lease ids.
    acquire_gate: tokio::sync::Mutex<()>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn BlobStore>, config: LeaseConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(State {
                store,
                config,
                leases: Mutex::new(HashMap::new()),
                cleaning: Mutex::new(HashSet::new()),
                events,
            }),
            acquire_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribes to lease lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.state.events.subscribe()
    }

    /// Acquires an exclusive lease on `target` for `tracking_id`.
    ///
    /// A lease already shown as held on the blob is force-broken first (it
    /// belongs to a crashed or abandoned session), with a short settle delay
    /// before the fresh acquire. With `auto_renew`, a background task renews
    /// at `duration - renewal_buffer`.
    pub async fn acquire(
        &self,
        target: &BlobTarget,
        tracking_id: &str,
        auto_renew: bool,
    ) -> Result<String, LeaseError> {
        let _gate = self.acquire_gate.lock().await;

        // Resuming transfer with a live lease: reuse it.
        if let Some(id) = self.lease_id(tracking_id) {
            debug!(tracking = tracking_id, "lease already active, reusing");
            return Ok(id);
        }

        let props = self.state.store.probe(target).await?;
        if props.lease_state == LeaseState::Leased {
            info!(tracking = tracking_id, blob = %target, "breaking abandoned lease");
            self.state.store.break_lease(target).await?;
            tokio::time::sleep(self.state.config.settle_delay).await;
        }

        let lease_id = self
            .state
            .store
            .acquire_lease(target, self.state.config.duration)
            .await?;

        let renew_cancel = if auto_renew {
            let cancel = CancellationToken::new();
            tokio::spawn(renewal_loop(
                Arc::clone(&self.state),
                tracking_id.to_string(),
                cancel.clone(),
            ));
            Some(cancel)
        } else {
            None
        };

        let mut leases = self.state.leases.lock().unwrap();
        leases.insert(
            tracking_id.to_string(),
            Held {
                lease_id: lease_id.clone(),
                target: target.clone(),
                expires_at: Instant::now() + self.state.config.duration,
                renew_cancel,
            },
        );
        drop(leases);

        info!(tracking = tracking_id, blob = %target, "lease acquired");
        let _ = self.state.events.send(LeaseEvent::Acquired {
            tracking_id: tracking_id.to_string(),
            lease_id: lease_id.clone(),
        });
        Ok(lease_id)
    }

    /// Releases the lease held for `tracking_id`.
    ///
    /// If the release call itself fails, falls back to a forced break so the
    /// blob is never left unreleasable.
    pub async fn release(&self, target: &BlobTarget, tracking_id: &str) -> Result<(), LeaseError> {
        let held = {
            let mut leases = self.state.leases.lock().unwrap();
            leases
                .remove(tracking_id)
                .ok_or_else(|| LeaseError::NotHeld(tracking_id.to_string()))?
        };
        if let Some(cancel) = &held.renew_cancel {
            cancel.cancel();
        }

        if let Err(e) = self
            .state
            .store
            .release_lease(target, &held.lease_id)
            .await
        {
            warn!(
                tracking = tracking_id,
                error = %e,
                "lease release failed, forcing break"
            );
            self.state.store.break_lease(target).await?;
        }

        let _ = self.state.events.send(LeaseEvent::Released {
            tracking_id: tracking_id.to_string(),
        });
        Ok(())
    }

    /// Returns `true` if a non-expired lease is held for `tracking_id`.
    pub fn is_active(&self, tracking_id: &str) -> bool {
        let leases = self.state.leases.lock().unwrap();
        leases
            .get(tracking_id)
            .is_some_and(|h| h.expires_at > Instant::now())
    }

    /// Returns the lease id held for `tracking_id`, if still valid.
    pub fn lease_id(&self, tracking_id: &str) -> Option<String> {
        let leases = self.state.leases.lock().unwrap();
        leases
            .get(tracking_id)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.lease_id.clone())
    }

    /// Idempotent teardown for a tracking id. Safe to call concurrently with
    /// renewal or a second cleanup; only one caller does the work.
    pub async fn cleanup(&self, tracking_id: &str) {
        {
            let mut cleaning = self.state.cleaning.lock().unwrap();
            if !cleaning.insert(tracking_id.to_string()) {
                debug!(tracking = tracking_id, "cleanup already in progress");
                return;
            }
        }

        let target = {
            let leases = self.state.leases.lock().unwrap();
            leases.get(tracking_id).map(|h| h.target.clone())
        };
        if let Some(target) = target
            && let Err(e) = self.release(&target, tracking_id).await
        {
            // Cleanup is best-effort; the primary error already surfaced.
            warn!(tracking = tracking_id, error = %e, "lease cleanup failed");
        }

        self.state.cleaning.lock().unwrap().remove(tracking_id);
    }
}

/// Background renewal loop for one tracking id.
///
/// Never propagates an error out of the task: a failed renewal attempts a
/// break-and-reacquire, and a failed reacquire emits a terminal
/// [`LeaseEvent::Failed`].
async fn renewal_loop(state: Arc<State>, tracking_id: String, cancel: CancellationToken) {
    let interval = state.config.renew_interval();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(tracking = %tracking_id, "renewal loop cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        // Skip the cycle if a cleanup is tearing this lease down.
        if state.cleaning.lock().unwrap().contains(&tracking_id) {
            continue;
        }

        let Some((lease_id, target)) = ({
            let leases = state.leases.lock().unwrap();
            leases
                .get(&tracking_id)
                .map(|h| (h.lease_id.clone(), h.target.clone()))
        }) else {
            return; // Released while we slept.
        };

        match state.store.renew_lease(&target, &lease_id).await {
            Ok(()) => {
                let mut leases = state.leases.lock().unwrap();
                if let Some(held) = leases.get_mut(&tracking_id) {
                    held.expires_at = Instant::now() + state.config.duration;
                }
                drop(leases);
                debug!(tracking = %tracking_id, "lease renewed");
                let _ = state.events.send(LeaseEvent::Renewed {
                    tracking_id: tracking_id.clone(),
                    lease_id,
                });
            }
            Err(e) => {
                warn!(tracking = %tracking_id, error = %e, "renewal failed, reacquiring");
                match reacquire(&state, &target).await {
                    Ok(new_id) => {
                        let mut leases = state.leases.lock().unwrap();
                        if let Some(held) = leases.get_mut(&tracking_id) {
                            held.lease_id = new_id.clone();
                            held.expires_at = Instant::now() + state.config.duration;
                        }
                        drop(leases);
                        info!(tracking = %tracking_id, "lease reacquired");
                        let _ = state.events.send(LeaseEvent::Reacquired {
                            tracking_id: tracking_id.clone(),
                            lease_id: new_id,
                        });
                    }
                    Err(re) => {
                        warn!(tracking = %tracking_id, error = %re, "reacquire failed, lease lost");
                        state.leases.lock().unwrap().remove(&tracking_id);
                        let _ = state.events.send(LeaseEvent::Failed {
                            tracking_id: tracking_id.clone(),
                            reason: re.to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }
}

/// Break, settle, acquire.
async fn reacquire(state: &State, target: &BlobTarget) -> Result<String, LeaseError> {
    state.store.break_lease(target).await?;
    tokio::time::sleep(state.config.settle_delay).await;
    let id = state
        .store
        .acquire_lease(target, state.config.duration)
        .await?;
    Ok(id)
}
