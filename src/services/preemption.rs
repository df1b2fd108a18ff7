//! Preemption planning: victim selection, checkpointing, and resume.
//!
//! The planner holds only a narrow [`ResourceReleaser`] capability rather
//! than the scheduler itself. Victim eviction is ordered by node id so
//! multi-node evictions always take node locks in lexical order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::error::ScheduleError;
use crate::domain::models::{AgentPriority, Node, ResourceSpec};
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};
use crate::services::resource_index::ResourceIndex;
use crate::services::scheduler::PriorityDirectory;

/// Configuration for the preemption planner.
#[derive(Debug, Clone)]
pub struct PreemptionConfig {
    pub enabled: bool,
    /// Minimum `requester.class - victim.class` for a victim to qualify.
    pub min_priority_difference: u32,
    /// Cap on victims evicted for a single request.
    pub max_victims_per_request: usize,
    /// Whether to snapshot victims before eviction.
    pub checkpoint_victims: bool,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_priority_difference: 100,
            max_victims_per_request: 3,
            checkpoint_victims: true,
        }
    }
}

/// The one capability the planner needs from the placement layer.
#[async_trait]
pub trait ResourceReleaser: Send + Sync {
    /// Release an agent's placement; true on success.
    async fn release_resources(&self, agent_id: &str) -> bool;
}

#[async_trait]
impl ResourceReleaser for ResourceIndex {
    async fn release_resources(&self, agent_id: &str) -> bool {
        self.release(agent_id).await
    }
}

/// Opaque snapshot of a preempted agent, sufficient for a later resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub agent_id: String,
    pub node_id: String,
    /// The resources the victim held; a resume request starts from these.
    pub resources: ResourceSpec,
    pub labels: HashMap<String, String>,
    /// Opaque state snapshot. The control plane cannot see agent internals,
    /// so this records the placement; the session gateway owns real state.
    pub snapshot: serde_json::Value,
    /// Estimated fraction of work completed at eviction time.
    pub progress_estimate: f64,
    pub taken_at: DateTime<Utc>,
}

/// Registry entry for an agent currently preempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionRecord {
    pub agent_id: String,
    pub preempted_by: String,
    pub node_id: String,
    pub preempted_at: DateTime<Utc>,
}

/// Result of a successful preemption pass.
#[derive(Debug, Clone)]
pub struct PreemptionOutcome {
    /// Victims actually evicted, in eviction order.
    pub victims: Vec<String>,
    /// Aggregate resources freed by those evictions.
    pub freed: ResourceSpec,
}

struct VictimCandidate {
    agent_id: String,
    node_id: String,
    priority_value: u32,
    resources: ResourceSpec,
    labels: HashMap<String, String>,
}

/// Selects and evicts victims to make room for higher-priority requests.
pub struct PreemptionPlanner {
    config: PreemptionConfig,
    releaser: Arc<dyn ResourceReleaser>,
    priorities: Arc<PriorityDirectory>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    preempted: RwLock<HashMap<String, PreemptionRecord>>,
    bus: Arc<EventBus>,
}

impl PreemptionPlanner {
    pub fn new(
        config: PreemptionConfig,
        releaser: Arc<dyn ResourceReleaser>,
        priorities: Arc<PriorityDirectory>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            releaser,
            priorities,
            checkpoints: RwLock::new(HashMap::new()),
            preempted: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Free at least `requirements` by evicting lower-priority agents from
    /// `target_nodes`. No side effects unless the selected set covers the
    /// requirement.
    pub async fn preempt_for_resources(
        &self,
        requester_id: &str,
        requester_priority: AgentPriority,
        requirements: &ResourceSpec,
        target_nodes: &[Node],
    ) -> Result<PreemptionOutcome, ScheduleError> {
        if !self.config.enabled {
            return Err(ScheduleError::InsufficientResources);
        }
        if !requester_priority.is_preemptible() {
            // A Never-policy agent neither preempts nor is preempted.
            return Err(ScheduleError::PreemptionDisabled);
        }

        let mut candidates = self.collect_candidates(requester_id, requester_priority, target_nodes);

        // Lowest priority first; among equals prefer fewer, larger evictions.
        candidates.sort_by(|a, b| {
            a.priority_value.cmp(&b.priority_value).then_with(|| {
                b.resources
                    .magnitude()
                    .partial_cmp(&a.resources.magnitude())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        let mut selected: Vec<VictimCandidate> = Vec::new();
        let mut freed = ResourceSpec::default();
        for candidate in candidates {
            if selected.len() >= self.config.max_victims_per_request {
                break;
            }
            if ResourceSpec::default().covers_with(&freed, requirements) {
                break;
            }
            freed.accumulate(&candidate.resources);
            selected.push(candidate);
        }

        if !ResourceSpec::default().covers_with(&freed, requirements) {
            return Err(ScheduleError::PreemptionInsufficient);
        }

        // Evict in node-id order so multi-node evictions lock nodes lexically.
        selected.sort_by(|a, b| {
            a.node_id
                .cmp(&b.node_id)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let mut victims = Vec::new();
        let mut actually_freed = ResourceSpec::default();
        for victim in selected {
            if self.config.checkpoint_victims {
                self.take_checkpoint(&victim).await;
            }
            if self.releaser.release_resources(&victim.agent_id).await {
                actually_freed.accumulate(&victim.resources);
                self.preempted.write().await.insert(
                    victim.agent_id.clone(),
                    PreemptionRecord {
                        agent_id: victim.agent_id.clone(),
                        preempted_by: requester_id.to_string(),
                        node_id: victim.node_id.clone(),
                        preempted_at: Utc::now(),
                    },
                );
                self.bus.emit(
                    EventSeverity::Warning,
                    EventCategory::Scheduling,
                    EventPayload::SchedulingPreempted {
                        agent_id: victim.agent_id.clone(),
                        node_id: victim.node_id.clone(),
                        preempted_by: requester_id.to_string(),
                    },
                );
                victims.push(victim.agent_id);
            } else {
                tracing::warn!(
                    agent_id = %victim.agent_id,
                    node_id = %victim.node_id,
                    "victim eviction failed"
                );
            }
        }

        if victims.is_empty() || !ResourceSpec::default().covers_with(&actually_freed, requirements)
        {
            return Err(ScheduleError::PreemptionInsufficient);
        }

        Ok(PreemptionOutcome {
            victims,
            freed: actually_freed,
        })
    }

    /// Consume the checkpoint for `agent_id` and clear its preempted mark.
    /// The caller re-issues a scheduling request from the checkpoint.
    pub async fn resume(&self, agent_id: &str) -> Option<Checkpoint> {
        self.preempted.write().await.remove(agent_id);
        self.checkpoints.write().await.remove(agent_id)
    }

    /// True iff a checkpoint is held for `agent_id`.
    pub async fn has_checkpoint(&self, agent_id: &str) -> bool {
        self.checkpoints.read().await.contains_key(agent_id)
    }

    /// Agents currently preempted and not yet resumed.
    pub async fn preempted_agents(&self) -> Vec<PreemptionRecord> {
        let mut records: Vec<PreemptionRecord> =
            self.preempted.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.preempted_at.cmp(&b.preempted_at));
        records
    }

    fn collect_candidates(
        &self,
        requester_id: &str,
        requester_priority: AgentPriority,
        target_nodes: &[Node],
    ) -> Vec<VictimCandidate> {
        let mut candidates = Vec::new();
        for node in target_nodes {
            for placed in node.agents.values() {
                if placed.agent_id == requester_id {
                    continue;
                }
                let victim_priority = self.priorities.get(&placed.agent_id);
                if !victim_priority.is_preemptible() {
                    continue;
                }
                let gap = requester_priority
                    .class
                    .value()
                    .saturating_sub(victim_priority.class.value());
                if gap < self.config.min_priority_difference {
                    continue;
                }
                candidates.push(VictimCandidate {
                    agent_id: placed.agent_id.clone(),
                    node_id: node.node_id.clone(),
                    priority_value: victim_priority.class.value(),
                    resources: placed.resources.clone(),
                    labels: placed.labels.clone(),
                });
            }
        }
        candidates
    }

    async fn take_checkpoint(&self, victim: &VictimCandidate) {
        let checkpoint = Checkpoint {
            agent_id: victim.agent_id.clone(),
            node_id: victim.node_id.clone(),
            resources: victim.resources.clone(),
            labels: victim.labels.clone(),
            snapshot: serde_json::json!({
                "node_id": victim.node_id,
                "resources": victim.resources,
            }),
            progress_estimate: 0.0,
            taken_at: Utc::now(),
        };
        self.checkpoints
            .write()
            .await
            .insert(victim.agent_id.clone(), checkpoint);
    }
}
