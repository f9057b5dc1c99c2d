//! Named circuit breakers.
//!
//! Every cross-cutting operation class (admission gates, lease calls, node
//! migration) is guarded by a breaker named for that class, so a failing
//! downstream dependency degrades one capability without cascading into the
//! rest. Callers check [`CircuitBreaker::guard`] before invoking the guarded
//! operation and record the outcome afterwards.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// State of one named breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the open window elapses.
    Open,
    /// One probe call is allowed through; its outcome decides the state.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects before moving to half-open.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Error returned when a guarded operation must fail fast.
///
/// Distinct from the guarded operation's own errors so callers and metrics
/// can tell "dependency degraded" from "this specific call failed".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open: {name}")]
pub struct CircuitOpen {
    pub name: String,
}

#[derive(Debug)]
struct Gate {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Registry of named fail-fast gates.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    gates: Mutex<HashMap<String, Gate>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the breaker for `name` currently rejects calls.
    ///
    /// An open breaker whose open window has elapsed transitions to
    /// half-open here and lets the probe call through.
    pub fn is_open(&self, name: &str) -> bool {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.entry(name.to_string()).or_insert_with(Gate::new);
        match gate.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = gate
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    debug!(breaker = name, "open window elapsed, moving to half-open");
                    gate.state = CircuitState::HalfOpen;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Fails fast with [`CircuitOpen`] if the breaker for `name` is open.
    pub fn guard(&self, name: &str) -> Result<(), CircuitOpen> {
        if self.is_open(name) {
            Err(CircuitOpen {
                name: name.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Records a successful guarded call. Closes a half-open breaker.
    pub fn record_success(&self, name: &str) {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.entry(name.to_string()).or_insert_with(Gate::new);
        if gate.state == CircuitState::HalfOpen {
            debug!(breaker = name, "probe succeeded, closing");
        }
        gate.state = CircuitState::Closed;
        gate.consecutive_failures = 0;
        gate.opened_at = None;
    }

    /// Records a failed guarded call. May open the breaker.
    pub fn record_error(&self, name: &str) {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.entry(name.to_string()).or_insert_with(Gate::new);
        match gate.state {
            CircuitState::HalfOpen => {
                warn!(breaker = name, "probe failed, reopening");
                gate.state = CircuitState::Open;
                gate.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                gate.consecutive_failures += 1;
                if gate.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = name,
                        failures = gate.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    gate.state = CircuitState::Open;
                    gate.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of the breaker for `name` (closed if never used).
    pub fn state(&self, name: &str) -> CircuitState {
        self.gates
            .lock()
            .unwrap()
            .get(name)
            .map(|g| g.state)
            .unwrap_or(CircuitState::Closed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
