//! Node records owned by the resource index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::resources::ResourceSpec;

/// Heartbeat TTL after which a node is considered dead and evicted.
pub const DEFAULT_NODE_TTL_SECS: u64 = 60;

/// An agent currently placed on a node, with the resources it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedAgent {
    pub agent_id: String,
    /// The agent's labels at placement time, used by affinity queries.
    pub labels: HashMap<String, String>,
    /// The resources recorded for this placement; `release` subtracts exactly these.
    pub resources: ResourceSpec,
    pub placed_at: DateTime<Utc>,
}

/// A placement target with capacity, labels, and the set of placed agents.
///
/// Invariant: `allocation ≤ capacity` in every dimension, maintained by the
/// resource index's atomic allocate/release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    /// Labels consulted by node-affinity selectors and topology keys.
    pub labels: HashMap<String, String>,
    pub capacity: ResourceSpec,
    pub allocation: ResourceSpec,
    /// Agents placed on this node, keyed by agent id.
    pub agents: HashMap<String, PlacedAgent>,
    pub last_heartbeat: DateTime<Utc>,
    pub healthy: bool,
}

impl Node {
    /// A freshly registered node: empty, healthy, heartbeat now.
    pub fn new(node_id: impl Into<String>, labels: HashMap<String, String>, capacity: ResourceSpec) -> Self {
        Self {
            node_id: node_id.into(),
            labels,
            capacity,
            allocation: ResourceSpec::default(),
            agents: HashMap::new(),
            last_heartbeat: Utc::now(),
            healthy: true,
        }
    }

    /// True iff the last heartbeat is within `ttl_secs` of `now`.
    pub fn is_live(&self, now: DateTime<Utc>, ttl_secs: u64) -> bool {
        (now - self.last_heartbeat).num_seconds() <= ttl_secs as i64
    }

    /// Current utilization of this node.
    pub fn utilization(&self) -> Utilization {
        let cpu = if self.capacity.cpu > 0.0 {
            self.allocation.cpu / self.capacity.cpu
        } else {
            0.0
        };
        let memory = if self.capacity.memory_mb > 0 {
            self.allocation.memory_mb as f64 / self.capacity.memory_mb as f64
        } else {
            0.0
        };
        Utilization::new(cpu, memory)
    }
}

/// Fractional utilization of a node in `[0.0, 1.0]` per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    /// Weighted blend: `0.6·cpu + 0.4·memory`.
    pub overall: f64,
}

impl Utilization {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            cpu,
            memory,
            overall: 0.6 * cpu + 0.4 * memory,
        }
    }
}
