//! Connection admission: authenticate, quota-check, rate-check, assign.
//!
//! A connection attempt walks the gate sequence in order and is rejected at
//! the first gate that says no, with a close code naming the gate. Each gate
//! call runs behind its own named circuit breaker, so a degraded quota
//! backend fails closed for quota checks without touching authentication.

mod controller;
mod traits;

pub use controller::{Admitted, AdmissionController, ConnectionRecord};
pub use traits::{
    AuthError, GateFuture, IdentityProvider, PromptFuture, QuotaService, RateLimiter,
    UpgradePrompter,
};

use stevedore_protocol::constants::{
    CLOSE_AUTH_ERROR, CLOSE_INVALID_CREDENTIAL, CLOSE_LIMIT_EXCEEDED, CLOSE_MISSING_CREDENTIAL,
};

/// A refused connection attempt: the close code to send and a human-readable
/// reason. Deliberately separate from internal errors; internal failures are
/// translated here before anything reaches the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rejected ({code}): {reason}")]
pub struct Rejection {
    pub code: u16,
    pub reason: String,
}

impl Rejection {
    pub fn missing_credential() -> Self {
        Self {
            code: CLOSE_MISSING_CREDENTIAL,
            reason: "Missing credential".into(),
        }
    }

    pub fn invalid_credential() -> Self {
        Self {
            code: CLOSE_INVALID_CREDENTIAL,
            reason: "Invalid or expired credential".into(),
        }
    }

    pub fn auth_error(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_AUTH_ERROR,
            reason: reason.into(),
        }
    }

    pub fn limit_exceeded(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_LIMIT_EXCEEDED,
            reason: reason.into(),
        }
    }

    /// Degraded dependency behind an open breaker.
    pub fn unavailable() -> Self {
        Self {
            code: CLOSE_LIMIT_EXCEEDED,
            reason: "Service temporarily unavailable".into(),
        }
    }
}
