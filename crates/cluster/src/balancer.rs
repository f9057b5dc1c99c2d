//! Node assignment, rebalance planning, and scaling evaluation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info, warn};

use stevedore_protocol::notify::{Notifier, TOPIC_CONNECTION_MOVED};
use stevedore_protocol::types::{NodeId, SubscriptionTier};

use crate::node::{ConnectionId, NodeMetrics, NodeStats, NodeStatus};
use crate::scaling::{LoadTrend, ScalingDecision, hour_weight};
use crate::ClusterError;

/// Balancer tuning.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Hard cap on connections pinned to one node.
    pub max_connections_per_node: usize,
    /// A node must exceed this load ratio before a rebalance is considered.
    pub rebalance_threshold: f64,
    /// Weighted load ratio above which the cluster scales up.
    pub scale_up_threshold: f64,
    /// Weighted load ratio below which the cluster scales down.
    pub scale_down_threshold: f64,
    /// Quiet period after any scaling action.
    pub cooldown: Duration,
    /// The cluster never scales below this many nodes.
    pub min_nodes: usize,
    /// How often the coordination loop re-evaluates scaling and rebalancing.
    pub health_check_interval: Duration,
    /// How often node metrics are sampled.
    pub metrics_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_connections_per_node: 500,
            rebalance_threshold: 0.8,
            scale_up_threshold: 0.75,
            scale_down_threshold: 0.3,
            cooldown: Duration::from_secs(5 * 60),
            min_nodes: 2,
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl ClusterConfig {
    /// Reads overrides from `STEVEDORE_MAX_CONNECTIONS_PER_NODE`,
    /// `STEVEDORE_REBALANCE_THRESHOLD`, `STEVEDORE_SCALE_COOLDOWN_SECS`,
    /// `STEVEDORE_HEALTH_CHECK_INTERVAL_SECS`, and
    /// `STEVEDORE_METRICS_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("STEVEDORE_MAX_CONNECTIONS_PER_NODE") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    config.max_connections_per_node = n;
                }
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_REBALANCE_THRESHOLD") {
            if let Ok(f) = v.parse::<f64>() {
                if f > 0.0 && f <= 1.0 {
                    config.rebalance_threshold = f;
                }
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_SCALE_COOLDOWN_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                config.cooldown = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_HEALTH_CHECK_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                if n > 0 {
                    config.health_check_interval = Duration::from_secs(n);
                }
            }
        }
        if let Ok(v) = std::env::var("STEVEDORE_METRICS_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                if n > 0 {
                    config.metrics_interval = Duration::from_secs(n);
                }
            }
        }
        config
    }
}

/// A proposed relocation of one connection, produced by
/// [`LoadBalancer::create_rebalance_plan`] and consumed once by the
/// migration handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub connection: ConnectionId,
    pub from: NodeId,
    pub to: NodeId,
}

struct Inner {
    nodes: BTreeMap<NodeId, NodeStats>,
    /// Reverse index: which node owns each connection.
    placements: HashMap<ConnectionId, NodeId>,
    trend: LoadTrend,
    last_scale_action: Option<DateTime<Utc>>,
}

/// Owns the cluster's node map and makes every placement decision.
pub struct LoadBalancer {
    config: ClusterConfig,
    notifier: Arc<dyn Notifier>,
    inner: Mutex<Inner>,
}

impl LoadBalancer {
    pub fn new(config: ClusterConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                placements: HashMap::new(),
                trend: LoadTrend::new(),
                last_scale_action: None,
            }),
        }
    }

    /// One node's weight capacity. A standard-tier connection is the nominal
    /// unit of cost, so capacity is the connection cap in standard weights.
    fn node_capacity(&self) -> f64 {
        self.config.max_connections_per_node as f64 * SubscriptionTier::Standard.weight()
    }

    // -----------------------------------------------------------------------
    // Node registry
    // -----------------------------------------------------------------------

    /// Registers a node with its configured tier preference.
    pub fn add_node(&self, id: NodeId, tier_preference: SubscriptionTier) {
        let mut inner = self.inner.lock().unwrap();
        info!(node = id, tier = ?tier_preference, "node registered");
        inner.nodes.insert(id, NodeStats::new(id, tier_preference));
    }

    /// Removes a node and forgets its connection placements.
    pub fn remove_node(&self, id: NodeId) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.remove(&id).ok_or(ClusterError::NodeNotFound(id))?;
        if !node.connections.is_empty() {
            warn!(
                node = id,
                connections = node.connections.len(),
                "removing node with live connections"
            );
        }
        inner.placements.retain(|_, n| *n != id);
        Ok(())
    }

    pub fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&id).ok_or(ClusterError::NodeNotFound(id))?;
        node.status = status;
        Ok(())
    }

    /// Stores the latest health-check metrics for a node.
    pub fn record_metrics(&self, id: NodeId, metrics: NodeMetrics) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&id).ok_or(ClusterError::NodeNotFound(id))?;
        node.metrics = metrics;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<NodeStats> {
        self.inner.lock().unwrap().nodes.get(&id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    fn accepts(&self, node: &NodeStats, tier: SubscriptionTier) -> bool {
        node.is_active()
            && node.connections.len() < self.config.max_connections_per_node
            && node.load_ratio(self.node_capacity()) < tier.headroom_threshold()
    }

    /// Picks the node a new connection of `tier` should land on.
    ///
    /// Nodes provisioned for the tier and under its headroom threshold win;
    /// otherwise the globally least weighted-loaded active node takes it.
    pub fn best_node(&self, tier: SubscriptionTier) -> Result<NodeId, ClusterError> {
        let inner = self.inner.lock().unwrap();
        let preferred = inner
            .nodes
            .values()
            .filter(|n| n.tier_preference == tier && self.accepts(n, tier))
            .min_by(|a, b| a.weighted_load().total_cmp(&b.weighted_load()));
        if let Some(node) = preferred {
            return Ok(node.id);
        }

        inner
            .nodes
            .values()
            .filter(|n| self.accepts(n, tier))
            .min_by(|a, b| a.weighted_load().total_cmp(&b.weighted_load()))
            .map(|n| n.id)
            .ok_or(ClusterError::NoCapacity(tier))
    }

    /// Pins a connection to a node.
    pub fn register_connection(
        &self,
        node_id: NodeId,
        connection: &str,
        tier: SubscriptionTier,
    ) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(ClusterError::NodeNotFound(node_id))?;
        node.connections.insert(connection.to_string(), tier);
        inner.placements.insert(connection.to_string(), node_id);
        Ok(())
    }

    /// Drops a connection, returning the node it was on.
    pub fn unregister_connection(&self, connection: &str) -> Option<NodeId> {
        let mut inner = self.inner.lock().unwrap();
        let node_id = inner.placements.remove(connection)?;
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.connections.remove(connection);
        }
        Some(node_id)
    }

    pub fn node_of(&self, connection: &str) -> Option<NodeId> {
        self.inner.lock().unwrap().placements.get(connection).copied()
    }

    /// Bumps a node's in-flight upload count.
    pub fn upload_started(&self, node_id: NodeId) {
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&node_id) {
            node.active_uploads += 1;
        }
    }

    pub fn upload_finished(&self, node_id: NodeId) {
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&node_id) {
            node.active_uploads = node.active_uploads.saturating_sub(1);
        }
    }

    // -----------------------------------------------------------------------
    // Rebalance
    // -----------------------------------------------------------------------

    /// Proposes relocating one connection off the least-loaded node so it
    /// can drain.
    ///
    /// Conservative by construction: requires at least two active nodes,
    /// some node over the rebalance threshold, and a source with no active
    /// uploads and at most the one connection being moved. On success the
    /// source is marked [`NodeStatus::Draining`]. Returns `Ok(None)` when
    /// the cluster is balanced or the source is already empty.
    pub fn create_rebalance_plan(&self) -> Result<Option<MigrationPlan>, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let capacity = self.node_capacity();

        let mut active: Vec<&NodeStats> =
            inner.nodes.values().filter(|n| n.is_active()).collect();
        if active.len() < 2 {
            return Err(ClusterError::NotEnoughNodes {
                needed: 2,
                have: active.len(),
            });
        }
        active.sort_by(|a, b| a.weighted_load().total_cmp(&b.weighted_load()));

        // Nothing is hot enough to justify disturbing a connection.
        let hottest = active.last().map(|n| n.load_ratio(capacity)).unwrap_or(0.0);
        if hottest < self.config.rebalance_threshold {
            return Ok(None);
        }

        let source = active[0];
        let target = active[1];
        if !source.is_idle() {
            debug!(
                node = source.id,
                uploads = source.active_uploads,
                connections = source.connections.len(),
                "rebalance skipped, source not idle"
            );
            return Ok(None);
        }
        let Some(connection) = source.connections.keys().next().cloned() else {
            // Already empty; nothing to migrate.
            return Ok(None);
        };

        let plan = MigrationPlan {
            connection,
            from: source.id,
            to: target.id,
        };
        let from = plan.from;
        if let Some(node) = inner.nodes.get_mut(&from) {
            node.status = NodeStatus::Draining;
        }
        info!(from = plan.from, to = plan.to, connection = %plan.connection, "rebalance planned");
        Ok(Some(plan))
    }

    /// Moves a connection between nodes, re-validating that the target still
    /// accepts its tier. The move is atomic under the balancer lock; the
    /// connection is never present on both nodes.
    pub fn move_connection(
        &self,
        connection: &str,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();

        let tier = inner
            .nodes
            .get(&from)
            .ok_or(ClusterError::NodeNotFound(from))?
            .connections
            .get(connection)
            .copied()
            .ok_or_else(|| ClusterError::ConnectionNotFound(connection.to_string()))?;
        let target = inner.nodes.get(&to).ok_or(ClusterError::NodeNotFound(to))?;
        if !self.accepts(target, tier) {
            return Err(ClusterError::TierRefused { node: to, tier });
        }

        if let Some(node) = inner.nodes.get_mut(&from) {
            node.connections.remove(connection);
        }
        if let Some(node) = inner.nodes.get_mut(&to) {
            node.connections.insert(connection.to_string(), tier);
        }
        inner.placements.insert(connection.to_string(), to);
        drop(inner);

        info!(connection, from, to, "connection moved");
        self.notifier.publish(
            TOPIC_CONNECTION_MOVED,
            serde_json::json!({
                "connectionId": connection,
                "fromNode": from,
                "toNode": to,
            }),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scaling
    // -----------------------------------------------------------------------

    /// Evaluates whether the cluster should grow or shrink at `now`.
    ///
    /// The weighted load ratio is amplified by the hour-of-day weight, then
    /// compared with the smoothed history for that hour to get a trend. Any
    /// action arms the cooldown; the cluster never shrinks below the
    /// configured node floor.
    pub fn evaluate_scaling(&self, now: DateTime<Utc>) -> ScalingDecision {
        let mut inner = self.inner.lock().unwrap();

        let mut total_load = 0.0;
        let mut node_count = 0usize;
        for node in inner.nodes.values().filter(|n| n.is_active()) {
            total_load += node.weighted_load();
            node_count += 1;
        }
        if node_count == 0 {
            return ScalingDecision::Hold;
        }
        let ratio = total_load / (node_count as f64 * self.node_capacity());

        let hour = now.hour();
        let weighted = ratio * hour_weight(hour);
        let trend = inner.trend.observe(hour, weighted);

        let in_cooldown = inner
            .last_scale_action
            .map(|last| match (now - last).to_std() {
                Ok(elapsed) => elapsed < self.config.cooldown,
                Err(_) => true,
            })
            .unwrap_or(false);
        if in_cooldown {
            return ScalingDecision::Hold;
        }

        let decision = if weighted > self.config.scale_up_threshold && trend > 0.0 {
            ScalingDecision::ScaleUp
        } else if weighted < self.config.scale_down_threshold
            && trend < 0.0
            && node_count > self.config.min_nodes
        {
            ScalingDecision::ScaleDown
        } else {
            ScalingDecision::Hold
        };

        if decision != ScalingDecision::Hold {
            info!(?decision, ratio, weighted, trend, nodes = node_count, "scaling action");
            inner.last_scale_action = Some(now);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stevedore_protocol::notify::{ChannelNotifier, NullNotifier};

    fn balancer(config: ClusterConfig) -> LoadBalancer {
        LoadBalancer::new(config, Arc::new(NullNotifier))
    }

    fn small_config() -> ClusterConfig {
        ClusterConfig {
            max_connections_per_node: 4,
            ..ClusterConfig::default()
        }
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    #[test]
    fn best_node_prefers_matching_tier_under_headroom() {
        let lb = balancer(small_config());
        lb.add_node(1, SubscriptionTier::Premium);
        lb.add_node(2, SubscriptionTier::Free);

        // Node 2 is emptier, but node 1 is provisioned for premium.
        lb.register_connection(1, "c1", SubscriptionTier::Premium).unwrap();
        assert_eq!(lb.best_node(SubscriptionTier::Premium).unwrap(), 1);
    }

    #[test]
    fn best_node_falls_back_to_least_loaded() {
        let lb = balancer(small_config());
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.register_connection(1, "c1", SubscriptionTier::Premium).unwrap();

        // No standard-preferring node exists; least weighted load wins.
        assert_eq!(lb.best_node(SubscriptionTier::Standard).unwrap(), 2);
    }

    #[test]
    fn best_node_skips_draining_and_full_nodes() {
        let lb = balancer(ClusterConfig {
            max_connections_per_node: 1,
            ..ClusterConfig::default()
        });
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.set_node_status(1, NodeStatus::Draining).unwrap();
        lb.register_connection(2, "c1", SubscriptionTier::Free).unwrap();

        assert!(matches!(
            lb.best_node(SubscriptionTier::Free),
            Err(ClusterError::NoCapacity(_))
        ));
    }

    #[test]
    fn rebalance_requires_two_active_nodes() {
        let lb = balancer(small_config());
        lb.add_node(1, SubscriptionTier::Free);
        assert!(matches!(
            lb.create_rebalance_plan(),
            Err(ClusterError::NotEnoughNodes { needed: 2, have: 1 })
        ));
    }

    #[test]
    fn rebalance_never_disturbs_a_busy_source() {
        let lb = balancer(small_config());
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);

        // Node 2 is hot; node 1 is the least-loaded source candidate but
        // has two live connections, so nothing may move.
        lb.register_connection(1, "a", SubscriptionTier::Free).unwrap();
        lb.register_connection(1, "b", SubscriptionTier::Free).unwrap();
        for i in 0..4 {
            lb.register_connection(2, &format!("p{i}"), SubscriptionTier::Premium).unwrap();
        }
        assert!(lb.create_rebalance_plan().unwrap().is_none());

        // Same with an active upload on an otherwise movable source.
        lb.unregister_connection("b");
        lb.upload_started(1);
        assert!(lb.create_rebalance_plan().unwrap().is_none());
    }

    #[test]
    fn rebalance_drains_idle_source_and_names_its_connection() {
        let lb = balancer(small_config());
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.register_connection(1, "lonely", SubscriptionTier::Free).unwrap();
        for i in 0..4 {
            lb.register_connection(2, &format!("p{i}"), SubscriptionTier::Premium).unwrap();
        }

        let plan = lb.create_rebalance_plan().unwrap().expect("plan");
        assert_eq!(plan.connection, "lonely");
        assert_eq!(plan.from, 1);
        assert_eq!(plan.to, 2);
        assert_eq!(lb.node(1).unwrap().status, NodeStatus::Draining);
    }

    #[test]
    fn no_rebalance_below_threshold() {
        let lb = balancer(small_config());
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.register_connection(1, "a", SubscriptionTier::Free).unwrap();
        assert!(lb.create_rebalance_plan().unwrap().is_none());
    }

    #[tokio::test]
    async fn move_connection_updates_both_nodes_and_publishes() {
        let (notifier, mut rx) = ChannelNotifier::new(8);
        let lb = LoadBalancer::new(small_config(), Arc::new(notifier));
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.register_connection(1, "c1", SubscriptionTier::Standard).unwrap();

        lb.move_connection("c1", 1, 2).unwrap();
        assert!(lb.node(1).unwrap().connections.is_empty());
        assert!(lb.node(2).unwrap().connections.contains_key("c1"));
        assert_eq!(lb.node_of("c1"), Some(2));

        let n = rx.recv().await.unwrap();
        assert_eq!(n.topic, TOPIC_CONNECTION_MOVED);
        assert_eq!(n.payload["connectionId"], "c1");
        assert_eq!(n.payload["toNode"], 2);
    }

    #[test]
    fn move_connection_revalidates_target_tier() {
        let lb = balancer(ClusterConfig {
            max_connections_per_node: 1,
            ..ClusterConfig::default()
        });
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.register_connection(1, "c1", SubscriptionTier::Standard).unwrap();
        lb.register_connection(2, "c2", SubscriptionTier::Free).unwrap();

        // Target is full: tier revalidation refuses, nothing moves.
        let err = lb.move_connection("c1", 1, 2).unwrap_err();
        assert!(matches!(err, ClusterError::TierRefused { node: 2, .. }));
        assert!(lb.node(1).unwrap().connections.contains_key("c1"));
    }

    #[test]
    fn scaling_up_needs_high_and_rising_load() {
        let lb = balancer(ClusterConfig {
            max_connections_per_node: 2,
            cooldown: Duration::from_secs(0),
            ..ClusterConfig::default()
        });
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);

        // First sample seeds the hour bucket: flat trend, no action.
        lb.register_connection(1, "a", SubscriptionTier::Premium).unwrap();
        lb.register_connection(1, "b", SubscriptionTier::Premium).unwrap();
        assert_eq!(lb.evaluate_scaling(at_hour(12)), ScalingDecision::Hold);

        // Load rises within the same hour bucket.
        lb.register_connection(2, "c", SubscriptionTier::Premium).unwrap();
        lb.register_connection(2, "d", SubscriptionTier::Premium).unwrap();
        assert_eq!(lb.evaluate_scaling(at_hour(12)), ScalingDecision::ScaleUp);
    }

    #[test]
    fn cooldown_suppresses_consecutive_actions() {
        let lb = balancer(ClusterConfig {
            max_connections_per_node: 2,
            ..ClusterConfig::default()
        });
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);
        lb.register_connection(1, "a", SubscriptionTier::Premium).unwrap();
        lb.register_connection(1, "b", SubscriptionTier::Premium).unwrap();
        lb.evaluate_scaling(at_hour(12));

        lb.register_connection(2, "c", SubscriptionTier::Premium).unwrap();
        lb.register_connection(2, "d", SubscriptionTier::Premium).unwrap();
        assert_eq!(lb.evaluate_scaling(at_hour(12)), ScalingDecision::ScaleUp);

        // Still hot and rising two minutes later, but inside the cooldown.
        lb.evaluate_scaling(at_hour(12));
        let later = at_hour(12) + chrono::Duration::minutes(2);
        assert_eq!(lb.evaluate_scaling(later), ScalingDecision::Hold);
    }

    #[test]
    fn never_scales_below_node_floor() {
        let lb = balancer(ClusterConfig {
            cooldown: Duration::from_secs(0),
            ..ClusterConfig::default()
        });
        lb.add_node(1, SubscriptionTier::Free);
        lb.add_node(2, SubscriptionTier::Free);

        // Empty cluster, falling trend after a seeded bucket.
        lb.register_connection(1, "a", SubscriptionTier::Free).unwrap();
        lb.evaluate_scaling(at_hour(4));
        lb.unregister_connection("a");
        assert_eq!(lb.evaluate_scaling(at_hour(4)), ScalingDecision::Hold);
    }

    #[test]
    fn scales_down_above_floor_when_low_and_falling() {
        let lb = balancer(ClusterConfig {
            max_connections_per_node: 2,
            cooldown: Duration::from_secs(0),
            ..ClusterConfig::default()
        });
        for id in 1..=3 {
            lb.add_node(id, SubscriptionTier::Free);
        }
        lb.register_connection(1, "a", SubscriptionTier::Free).unwrap();
        lb.evaluate_scaling(at_hour(4));
        lb.unregister_connection("a");
        assert_eq!(lb.evaluate_scaling(at_hour(4)), ScalingDecision::ScaleDown);
    }

    #[test]
    fn metrics_update_requires_known_node() {
        let lb = balancer(small_config());
        assert!(matches!(
            lb.record_metrics(9, NodeMetrics::default()),
            Err(ClusterError::NodeNotFound(9))
        ));
        lb.add_node(9, SubscriptionTier::Free);
        lb.record_metrics(
            9,
            NodeMetrics {
                cpu: 0.4,
                memory: 0.5,
                latency_ms: 12.0,
                error_count: 0,
            },
        )
        .unwrap();
        assert_eq!(lb.node(9).unwrap().metrics.cpu, 0.4);
    }
}
