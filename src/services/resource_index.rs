//! Authoritative per-node capacity, allocation, and placement state.
//!
//! Every mutation of a node goes through that node's own lock, so allocate
//! and release are atomic per node: either the agent joins the node's set and
//! every counter moves, or the node is untouched. The agent→node map doubles
//! as a reservation: an agent is inserted there before its node is touched,
//! which keeps placements unique without ever nesting locks.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::domain::models::{
    AgentSpec, Node, PlacedAgent, ResourceSpec, Utilization, DEFAULT_NODE_TTL_SECS,
};
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};

/// Configuration for the resource index.
#[derive(Debug, Clone)]
pub struct ResourceIndexConfig {
    /// Heartbeat TTL; nodes silent longer than this are evicted by the sweep.
    pub node_ttl_secs: u64,
}

impl Default for ResourceIndexConfig {
    fn default() -> Self {
        Self {
            node_ttl_secs: DEFAULT_NODE_TTL_SECS,
        }
    }
}

/// Cluster-wide utilization summary.
#[derive(Debug, Clone)]
pub struct ClusterUtilization {
    pub per_node: HashMap<String, Utilization>,
    /// Mean of the per-node `overall` values; `0.0` for an empty cluster.
    pub average_overall: f64,
}

/// The resource index: node records and the agent→node placement map.
pub struct ResourceIndex {
    config: ResourceIndexConfig,
    nodes: RwLock<HashMap<String, Arc<Mutex<Node>>>>,
    agent_nodes: RwLock<HashMap<String, String>>,
    bus: Arc<EventBus>,
}

impl ResourceIndex {
    pub fn new(config: ResourceIndexConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            agent_nodes: RwLock::new(HashMap::new()),
            bus,
        }
    }

    // -------------------------------------------------------------------------
    // Node lifecycle
    // -------------------------------------------------------------------------

    /// Register a node. Re-registration replaces the record and drops any
    /// allocations the old record carried.
    pub async fn register_node(
        &self,
        node_id: impl Into<String>,
        labels: HashMap<String, String>,
        capacity: ResourceSpec,
    ) {
        let node_id = node_id.into();
        let node = Node::new(node_id.clone(), labels, capacity);
        let replaced = {
            let mut nodes = self.nodes.write().await;
            nodes
                .insert(node_id.clone(), Arc::new(Mutex::new(node)))
                .is_some()
        };
        if replaced {
            tracing::warn!(node_id, "node re-registered, prior allocations dropped");
            self.drop_placements_on(&node_id).await;
        }
        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Node,
            EventPayload::NodeRegistered {
                node_id: node_id.clone(),
            },
        );
        tracing::info!(node_id, "node registered");
    }

    /// Refresh a node's heartbeat and health flag. Unknown nodes warn and no-op.
    pub async fn heartbeat(&self, node_id: &str, healthy: bool) -> bool {
        let Some(entry) = self.node_entry(node_id).await else {
            tracing::warn!(node_id, "heartbeat for unknown node");
            return false;
        };
        let mut node = entry.lock().await;
        node.last_heartbeat = chrono::Utc::now();
        node.healthy = healthy;
        true
    }

    /// Remove a node explicitly, orphan-cleaning its placements.
    pub async fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.nodes.write().await.remove(node_id).is_some();
        if !removed {
            tracing::warn!(node_id, "remove for unknown node");
            return false;
        }
        self.drop_placements_on(node_id).await;
        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Node,
            EventPayload::NodeRemoved {
                node_id: node_id.to_string(),
                reason: "unregistered".to_string(),
            },
        );
        true
    }

    /// Evict nodes whose last heartbeat is older than the TTL.
    ///
    /// Agents placed on evicted nodes are not auto-unscheduled, but their
    /// placement entries are orphan-cleaned so future queries stay consistent.
    /// Returns the evicted node ids. Idempotent.
    pub async fn purge_stale(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        let entries: Vec<(String, Arc<Mutex<Node>>)> = {
            let nodes = self.nodes.read().await;
            nodes
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };
        let mut stale = Vec::new();
        for (node_id, entry) in entries {
            let node = entry.lock().await;
            if !node.is_live(now, self.config.node_ttl_secs) {
                stale.push(node_id);
            }
        }
        if stale.is_empty() {
            return stale;
        }
        {
            let mut nodes = self.nodes.write().await;
            for node_id in &stale {
                nodes.remove(node_id);
            }
        }
        for node_id in &stale {
            self.drop_placements_on(node_id).await;
            self.bus.emit(
                EventSeverity::Warning,
                EventCategory::Node,
                EventPayload::NodeRemoved {
                    node_id: node_id.clone(),
                    reason: "stale-heartbeat".to_string(),
                },
            );
            tracing::warn!(node_id, "node evicted after missed heartbeats");
        }
        stale
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Atomically place `agent` on `node_id` if every requested dimension fits.
    ///
    /// Returns false without touching the node when the agent is already
    /// placed somewhere, the node is unknown, or capacity would be exceeded.
    pub async fn allocate(
        &self,
        agent: &AgentSpec,
        node_id: &str,
        requirements: &ResourceSpec,
    ) -> bool {
        // Reserve the agent slot first; placements are unique per agent.
        {
            let mut agent_nodes = self.agent_nodes.write().await;
            if agent_nodes.contains_key(&agent.agent_id) {
                tracing::warn!(agent_id = %agent.agent_id, "agent already has a placement");
                return false;
            }
            agent_nodes.insert(agent.agent_id.clone(), node_id.to_string());
        }

        let Some(entry) = self.node_entry(node_id).await else {
            tracing::warn!(node_id, "allocate against unknown node");
            self.agent_nodes.write().await.remove(&agent.agent_id);
            return false;
        };

        let placed = {
            let mut node = entry.lock().await;
            if node.allocation.fits(requirements, &node.capacity) {
                node.allocation.accumulate(requirements);
                node.agents.insert(
                    agent.agent_id.clone(),
                    PlacedAgent {
                        agent_id: agent.agent_id.clone(),
                        labels: agent.labels.clone(),
                        resources: requirements.clone(),
                        placed_at: chrono::Utc::now(),
                    },
                );
                true
            } else {
                false
            }
        };

        if !placed {
            self.agent_nodes.write().await.remove(&agent.agent_id);
        }
        placed
    }

    /// Release an agent's placement using its recorded allocation record.
    pub async fn release(&self, agent_id: &str) -> bool {
        let Some(node_id) = self.agent_nodes.read().await.get(agent_id).cloned() else {
            tracing::warn!(agent_id, "release for unplaced agent");
            return false;
        };

        if let Some(entry) = self.node_entry(&node_id).await {
            let mut node = entry.lock().await;
            if let Some(placed) = node.agents.remove(agent_id) {
                let resources = placed.resources;
                node.allocation.subtract(&resources);
            }
        }
        self.agent_nodes.write().await.remove(agent_id);
        true
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot of one node's record.
    pub async fn get_allocation(&self, node_id: &str) -> Option<Node> {
        let entry = self.node_entry(node_id).await?;
        let node = entry.lock().await;
        Some(node.clone())
    }

    /// Snapshots of every node record.
    pub async fn list_allocations(&self) -> Vec<Node> {
        let entries: Vec<Arc<Mutex<Node>>> = {
            let nodes = self.nodes.read().await;
            nodes.values().cloned().collect()
        };
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.clone());
        }
        snapshots.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        snapshots
    }

    /// Snapshots of nodes that are healthy and within the heartbeat TTL.
    pub async fn live_healthy(&self) -> Vec<Node> {
        let now = chrono::Utc::now();
        self.list_allocations()
            .await
            .into_iter()
            .filter(|node| node.healthy && node.is_live(now, self.config.node_ttl_secs))
            .collect()
    }

    /// The node an agent is currently placed on.
    pub async fn node_of(&self, agent_id: &str) -> Option<String> {
        self.agent_nodes.read().await.get(agent_id).cloned()
    }

    /// Current utilization of one node.
    pub async fn utilization(&self, node_id: &str) -> Option<Utilization> {
        let entry = self.node_entry(node_id).await?;
        let node = entry.lock().await;
        Some(node.utilization())
    }

    /// True iff `requirements` fits in the node's remaining capacity.
    /// Every requested dimension, gpu included, is a hard constraint.
    pub async fn has_capacity(&self, node_id: &str, requirements: &ResourceSpec) -> bool {
        let Some(entry) = self.node_entry(node_id).await else {
            return false;
        };
        let node = entry.lock().await;
        node.allocation.fits(requirements, &node.capacity)
    }

    /// Per-node utilization plus the cluster average.
    pub async fn cluster_utilization(&self) -> ClusterUtilization {
        let nodes = self.list_allocations().await;
        let per_node: HashMap<String, Utilization> = nodes
            .iter()
            .map(|node| (node.node_id.clone(), node.utilization()))
            .collect();
        let average_overall = if per_node.is_empty() {
            0.0
        } else {
            per_node.values().map(|u| u.overall).sum::<f64>() / per_node.len() as f64
        };
        ClusterUtilization {
            per_node,
            average_overall,
        }
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    async fn node_entry(&self, node_id: &str) -> Option<Arc<Mutex<Node>>> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Remove agent→node entries that point at `node_id`.
    async fn drop_placements_on(&self, node_id: &str) {
        let mut agent_nodes = self.agent_nodes.write().await;
        agent_nodes.retain(|agent_id, placed_on| {
            if placed_on == node_id {
                tracing::warn!(agent_id, node_id, "placement orphaned by node removal");
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ResourceIndex {
        ResourceIndex::new(ResourceIndexConfig::default(), Arc::new(EventBus::default()))
    }

    async fn register(index: &ResourceIndex, node_id: &str, cpu: f64, memory_mb: u64) {
        index
            .register_node(node_id, HashMap::new(), ResourceSpec::cpu_memory(cpu, memory_mb))
            .await;
    }

    #[tokio::test]
    async fn test_allocate_within_capacity() {
        let index = index();
        register(&index, "n1", 8.0, 32768).await;

        let agent = AgentSpec::new("a1");
        assert!(index.allocate(&agent, "n1", &ResourceSpec::cpu_memory(2.0, 4096)).await);

        let node = index.get_allocation("n1").await.unwrap();
        assert_eq!(node.agents.len(), 1);
        assert!((node.allocation.cpu - 2.0).abs() < 1e-9);
        assert_eq!(index.node_of("a1").await.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_allocate_rejects_over_capacity() {
        let index = index();
        register(&index, "n1", 2.0, 4096).await;

        let agent = AgentSpec::new("a1");
        assert!(!index.allocate(&agent, "n1", &ResourceSpec::cpu_memory(4.0, 1024)).await);

        // Node untouched, no placement recorded.
        let node = index.get_allocation("n1").await.unwrap();
        assert!(node.agents.is_empty());
        assert_eq!(node.allocation.cpu, 0.0);
        assert!(index.node_of("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_agent_uniqueness() {
        let index = index();
        register(&index, "n1", 8.0, 32768).await;
        register(&index, "n2", 8.0, 32768).await;

        let agent = AgentSpec::new("a1");
        let requirements = ResourceSpec::cpu_memory(1.0, 1024);
        assert!(index.allocate(&agent, "n1", &requirements).await);
        assert!(!index.allocate(&agent, "n2", &requirements).await);

        let n2 = index.get_allocation("n2").await.unwrap();
        assert!(n2.agents.is_empty());
    }

    #[tokio::test]
    async fn test_release_restores_allocation() {
        let index = index();
        register(&index, "n1", 8.0, 32768).await;

        let agent = AgentSpec::new("a1");
        let requirements = ResourceSpec::cpu_memory(3.0, 12000);
        index.allocate(&agent, "n1", &requirements).await;
        assert!(index.release("a1").await);

        let node = index.get_allocation("n1").await.unwrap();
        assert_eq!(node.allocation.cpu, 0.0);
        assert_eq!(node.allocation.memory_mb, 0);
        assert!(node.agents.is_empty());
        assert!(index.node_of("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_release_unknown_agent_is_noop() {
        let index = index();
        assert!(!index.release("ghost").await);
    }

    #[tokio::test]
    async fn test_has_capacity_checks_gpu() {
        let index = index();
        index
            .register_node(
                "n1",
                HashMap::new(),
                ResourceSpec {
                    gpu_count: Some(1),
                    ..ResourceSpec::cpu_memory(8.0, 32768)
                },
            )
            .await;

        let gpu_request = ResourceSpec {
            gpu_count: Some(2),
            ..ResourceSpec::cpu_memory(1.0, 1024)
        };
        assert!(!index.has_capacity("n1", &gpu_request).await);
        assert!(
            index
                .has_capacity(
                    "n1",
                    &ResourceSpec {
                        gpu_count: Some(1),
                        ..ResourceSpec::cpu_memory(1.0, 1024)
                    }
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_utilization_and_cluster_average() {
        let index = index();
        register(&index, "n1", 8.0, 32768).await;
        register(&index, "n2", 8.0, 32768).await;
        index
            .allocate(&AgentSpec::new("a1"), "n1", &ResourceSpec::cpu_memory(4.0, 16384))
            .await;

        let util = index.utilization("n1").await.unwrap();
        assert!((util.overall - (0.6 * 0.5 + 0.4 * 0.5)).abs() < 1e-9);

        let cluster = index.cluster_utilization().await;
        assert_eq!(cluster.per_node.len(), 2);
        assert!((cluster.average_overall - util.overall / 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_purge_stale_orphan_cleans_placements() {
        let index = index();
        register(&index, "n1", 8.0, 32768).await;
        index
            .allocate(&AgentSpec::new("a1"), "n1", &ResourceSpec::cpu_memory(1.0, 1024))
            .await;

        // Backdate the node's heartbeat past the TTL.
        {
            let entry = index.node_entry("n1").await.unwrap();
            let mut node = entry.lock().await;
            node.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(120);
        }

        let removed = index.purge_stale().await;
        assert_eq!(removed, vec!["n1".to_string()]);
        assert!(index.get_allocation("n1").await.is_none());
        assert!(index.node_of("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_marks_unhealthy() {
        let index = index();
        register(&index, "n1", 8.0, 32768).await;
        index.heartbeat("n1", false).await;
        assert!(index.live_healthy().await.is_empty());
        index.heartbeat("n1", true).await;
        assert_eq!(index.live_healthy().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_respect_capacity() {
        let index = Arc::new(index());
        register(&index, "n1", 4.0, 16384).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move {
                index
                    .allocate(
                        &AgentSpec::new(format!("a{i}")),
                        "n1",
                        &ResourceSpec::cpu_memory(1.0, 4096),
                    )
                    .await
            }));
        }
        let mut placed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                placed += 1;
            }
        }
        assert_eq!(placed, 4);

        let node = index.get_allocation("n1").await.unwrap();
        assert!(node.allocation.cpu <= node.capacity.cpu + 1e-9);
        assert!(node.allocation.memory_mb <= node.capacity.memory_mb);
        assert_eq!(node.agents.len(), 4);
    }
}
