//! Domain types shared across the workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Subscription tier of an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Standard,
    Premium,
}

impl SubscriptionTier {
    /// Load weight of one connection at this tier.
    ///
    /// This is the single source for tier weighting: both the per-node load
    /// metric and the cluster scaling ratio go through it, so the two can
    /// never drift apart.
    pub fn weight(&self) -> f64 {
        match self {
            SubscriptionTier::Free => 1.0,
            SubscriptionTier::Standard => 2.0,
            SubscriptionTier::Premium => 4.0,
        }
    }

    /// Fraction of a node's capacity this tier is allowed to fill before the
    /// balancer stops preferring the node for it.
    pub fn headroom_threshold(&self) -> f64 {
        match self {
            SubscriptionTier::Free => 0.9,
            SubscriptionTier::Standard => 0.8,
            SubscriptionTier::Premium => 0.7,
        }
    }
}

/// Authenticated identity attached to a connection.
///
/// Supplied by the external identity provider; the core only consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub tenant_id: String,
    pub tier: SubscriptionTier,
}

/// Lifecycle state of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Initializing,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` for states that still accept chunk work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UploadStatus::Initializing | UploadStatus::Uploading | UploadStatus::Paused
        )
    }

    /// Returns `true` for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Initializing => "initializing",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Control action a client may apply to an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadAction {
    Pause,
    Resume,
    Retry,
    Cancel,
}

impl FromStr for UploadAction {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(UploadAction::Pause),
            "resume" => Ok(UploadAction::Resume),
            "retry" => Ok(UploadAction::Retry),
            "cancel" => Ok(UploadAction::Cancel),
            other => Err(InvalidAction(other.to_string())),
        }
    }
}

/// Error for an unrecognized upload control action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid action: {0}")]
pub struct InvalidAction(pub String);

/// Identifier of a server node in the pool.
pub type NodeId = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_weight_increases_with_tier() {
        assert!(SubscriptionTier::Free.weight() < SubscriptionTier::Standard.weight());
        assert!(SubscriptionTier::Standard.weight() < SubscriptionTier::Premium.weight());
    }

    #[test]
    fn upload_action_from_str() {
        assert_eq!("pause".parse::<UploadAction>().unwrap(), UploadAction::Pause);
        assert_eq!("cancel".parse::<UploadAction>().unwrap(), UploadAction::Cancel);
        let err = "defenestrate".parse::<UploadAction>().unwrap_err();
        assert_eq!(err.0, "defenestrate");
    }

    #[test]
    fn status_activity() {
        assert!(UploadStatus::Uploading.is_active());
        assert!(UploadStatus::Paused.is_active());
        assert!(!UploadStatus::Failed.is_active());
        assert!(UploadStatus::Cancelled.is_terminal());
        assert!(!UploadStatus::Initializing.is_terminal());
    }

    #[test]
    fn principal_json_shape() {
        let p = Principal {
            user_id: "u1".into(),
            tenant_id: "t1".into(),
            tier: SubscriptionTier::Premium,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["tier"], "premium");
    }
}
