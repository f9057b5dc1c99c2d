//! Per-node state tracked by the balancer.

use std::collections::HashMap;

use stevedore_protocol::types::{NodeId, SubscriptionTier};

/// Identifier of one client connection.
pub type ConnectionId = String;

/// Health/availability state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Active,
    /// Being emptied by a rebalance; accepts no new connections.
    Draining,
    Unhealthy,
}

/// Resource metrics reported by the node's health-check loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeMetrics {
    /// CPU utilization, 0.0..=1.0.
    pub cpu: f64,
    /// Memory utilization, 0.0..=1.0.
    pub memory: f64,
    pub latency_ms: f64,
    pub error_count: u64,
}

/// Live view of one node: its connections, metrics, and availability.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub id: NodeId,
    /// Which tier this node is provisioned for. Explicit configuration, set
    /// when the node registers.
    pub tier_preference: SubscriptionTier,
    pub status: NodeStatus,
    /// Connections currently pinned to this node, with the tier that
    /// determines each one's load weight.
    pub connections: HashMap<ConnectionId, SubscriptionTier>,
    pub metrics: NodeMetrics,
    pub active_uploads: u32,
}

impl NodeStats {
    pub fn new(id: NodeId, tier_preference: SubscriptionTier) -> Self {
        Self {
            id,
            tier_preference,
            status: NodeStatus::Active,
            connections: HashMap::new(),
            metrics: NodeMetrics::default(),
            active_uploads: 0,
        }
    }

    /// Cost-to-serve load: the sum of tier weights over live connections, so
    /// a premium connection counts more than a free one.
    pub fn weighted_load(&self) -> f64 {
        self.connections.values().map(|t| t.weight()).sum()
    }

    /// Weighted load as a fraction of `capacity` weight units.
    pub fn load_ratio(&self, capacity: f64) -> f64 {
        if capacity <= 0.0 {
            return 1.0;
        }
        self.weighted_load() / capacity
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// True when a rebalance may move this node's last connection away:
    /// nothing uploading and no other connection that would be disturbed.
    pub fn is_idle(&self) -> bool {
        self.active_uploads == 0 && self.connections.len() <= 1
    }
}
