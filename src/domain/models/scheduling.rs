//! Scheduling request/result records and bin-packing strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::affinity::AgentAffinity;
use super::priority::AgentPriority;
use super::resources::ResourceSpec;

/// The agent descriptor carried by a scheduling request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    /// Labels other agents' affinity rules can select on.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A request to place one agent somewhere in the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub agent: AgentSpec,
    pub requirements: ResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<AgentAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<AgentPriority>,
    /// Restricts candidates to exactly these nodes when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_nodes: Option<Vec<String>>,
    /// Overall deadline in seconds; the scheduler default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl SchedulingRequest {
    pub fn new(agent: AgentSpec, requirements: ResourceSpec) -> Self {
        Self {
            agent,
            requirements,
            ..Self::default()
        }
    }

    /// Validate the request shape before any state is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent.agent_id.is_empty() {
            return Err("agent id cannot be empty".to_string());
        }
        self.requirements.validate()?;
        if let Some(affinity) = &self.affinity {
            affinity.validate()?;
        }
        Ok(())
    }
}

/// The outcome of one scheduling attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingResult {
    pub success: bool,
    pub agent_id: String,
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub allocated: Option<ResourceSpec>,
    /// Final affinity score of the chosen node, `0–100`.
    pub affinity_score: f64,
    /// Agents evicted to make room, in eviction order.
    pub preempted_agents: Vec<String>,
    /// Machine-readable failure code when `success` is false.
    pub error: Option<String>,
}

impl SchedulingResult {
    pub fn placed(
        agent_id: impl Into<String>,
        node_id: impl Into<String>,
        allocated: ResourceSpec,
        affinity_score: f64,
        preempted_agents: Vec<String>,
    ) -> Self {
        Self {
            success: true,
            agent_id: agent_id.into(),
            node_id: Some(node_id.into()),
            timestamp: Utc::now(),
            allocated: Some(allocated),
            affinity_score,
            preempted_agents,
            error: None,
        }
    }

    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            agent_id: agent_id.into(),
            node_id: None,
            timestamp: Utc::now(),
            allocated: None,
            affinity_score: 0.0,
            preempted_agents: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Tie-break strategy applied among equally ranked candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinPackingStrategy {
    /// Highest current utilization that still fits (minimizes fragmentation).
    #[default]
    BestFit,
    /// First candidate in ranking order.
    FirstFit,
    /// Lowest current utilization (spreads load).
    WorstFit,
    /// Node with the fewest placed agents.
    Spread,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation_empty_agent() {
        let request = SchedulingRequest::new(AgentSpec::default(), ResourceSpec::cpu_memory(1.0, 1024));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_request_validation_negative_cpu() {
        let request =
            SchedulingRequest::new(AgentSpec::new("a1"), ResourceSpec::cpu_memory(-1.0, 1024));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_result_constructors() {
        let ok = SchedulingResult::placed("a1", "n1", ResourceSpec::cpu_memory(1.0, 1024), 50.0, vec![]);
        assert!(ok.success);
        assert_eq!(ok.node_id.as_deref(), Some("n1"));
        assert!(ok.error.is_none());

        let err = SchedulingResult::failed("a1", "insufficient-resources");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("insufficient-resources"));
    }
}
