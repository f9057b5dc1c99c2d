//! External collaborator interfaces.
//!
//! All dyn-compatible via boxed futures, so the controller holds
//! `Arc<dyn ...>` handles and tests substitute fakes.

use std::future::Future;
use std::pin::Pin;

use stevedore_protocol::types::Principal;

/// Future returned by a gate collaborator.
pub type GateFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Future returned by a fire-and-forget collaborator.
pub type PromptFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Authentication outcome when the credential itself is the problem, as
/// opposed to the backend failing.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The credential is malformed, unknown, or expired. Not a backend
    /// fault; does not count against the auth circuit.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The identity backend itself failed.
    #[error("authentication backend error: {0}")]
    Backend(String),
}

/// Resolves a bearer token to the principal it belongs to.
pub trait IdentityProvider: Send + Sync {
    fn authenticate<'a>(&'a self, token: &'a str) -> GateFuture<'a, Principal, AuthError>;
}

/// Answers whether a principal's tier allows one more concurrent upload.
pub trait QuotaService: Send + Sync {
    /// `Ok(false)` means the tier is at its limit; `Err` means the quota
    /// backend failed.
    fn allow_upload<'a>(&'a self, principal: &'a Principal) -> GateFuture<'a, bool, String>;
}

/// Answers whether a principal (scoped by tenant) may open another
/// connection right now.
pub trait RateLimiter: Send + Sync {
    fn allow_connection<'a>(&'a self, principal: &'a Principal) -> GateFuture<'a, bool, String>;
}

/// Invoked before a quota rejection so the product side can offer an
/// upgrade. Best-effort; its outcome never changes the admission decision.
pub trait UpgradePrompter: Send + Sync {
    fn offer_upgrade<'a>(&'a self, principal: &'a Principal) -> PromptFuture<'a>;
}
