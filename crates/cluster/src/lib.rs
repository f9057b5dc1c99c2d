//! Cluster view and balancing decisions.
//!
//! Tracks per-node connection load weighted by subscription tier, assigns new
//! connections to the best node, plans conservative rebalances, and evaluates
//! whether the cluster should scale. The balancer owns the node map; other
//! components only read through its query methods.

mod balancer;
mod node;
mod scaling;

pub use balancer::{ClusterConfig, LoadBalancer, MigrationPlan};
pub use node::{ConnectionId, NodeMetrics, NodeStats, NodeStatus};
pub use scaling::ScalingDecision;

use stevedore_protocol::types::{NodeId, SubscriptionTier};

/// Errors from balancing and migration operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("need at least {needed} active nodes, have {have}")]
    NotEnoughNodes { needed: usize, have: usize },

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("node {node} does not accept tier {tier:?}")]
    TierRefused {
        node: NodeId,
        tier: SubscriptionTier,
    },

    #[error("no node has capacity for tier {0:?}")]
    NoCapacity(SubscriptionTier),
}
