//! Scheduler core: placement orchestration over the resource index,
//! affinity evaluator, and preemption planner.
//!
//! Requests are validated, candidates ranked by affinity, then walked in
//! bin-packing order until an allocation commits. Capacity misses fall back
//! to one preemption pass and a single retry on the same ranking. Every
//! decision is emitted on the `scheduling.*` channel and recorded in a
//! bounded decision log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};

use crate::domain::error::ScheduleError;
use crate::domain::models::{
    AgentAffinity, AgentPriority, BinPackingStrategy, ResourceSpec, SchedulingRequest,
    SchedulingResult,
};
use crate::services::affinity_evaluator::{AffinityEvaluator, RankedNode};
use crate::services::audit_log::{AuditCategory, AuditLevel, AuditLog};
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};
use crate::services::preemption::PreemptionPlanner;
use crate::services::resource_index::ResourceIndex;

/// Default overall deadline for one scheduling request.
pub const DEFAULT_SCHEDULE_DEADLINE_SECS: u64 = 30;

/// Configuration for the scheduler core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tie-break strategy among equally ranked candidates.
    pub strategy: BinPackingStrategy,
    /// Whether capacity misses may trigger preemption.
    pub preemption_enabled: bool,
    /// Deadline applied when a request does not carry its own.
    pub default_deadline_secs: u64,
    /// Retention bound of the in-memory decision log.
    pub decision_log_entries: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: BinPackingStrategy::BestFit,
            preemption_enabled: true,
            default_deadline_secs: DEFAULT_SCHEDULE_DEADLINE_SECS,
            decision_log_entries: 1000,
        }
    }
}

/// Agent-priority table, exclusively owned by the scheduler core.
/// The preemption planner consults it through a shared handle.
pub struct PriorityDirectory {
    entries: std::sync::RwLock<HashMap<String, AgentPriority>>,
}

impl PriorityDirectory {
    pub fn new() -> Self {
        Self {
            entries: std::sync::RwLock::new(HashMap::new()),
        }
    }

    fn guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentPriority>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set(&self, agent_id: impl Into<String>, priority: AgentPriority) {
        self.guard().insert(agent_id.into(), priority);
    }

    /// The recorded priority, or the default (Normal / preemptible) if unknown.
    pub fn get(&self, agent_id: &str) -> AgentPriority {
        match self.entries.read() {
            Ok(entries) => entries.get(agent_id).copied().unwrap_or_default(),
            Err(poisoned) => poisoned
                .into_inner()
                .get(agent_id)
                .copied()
                .unwrap_or_default(),
        }
    }

    pub fn forget(&self, agent_id: &str) {
        self.guard().remove(agent_id);
    }
}

impl Default for PriorityDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of the scheduler's decision log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    /// `schedule`, `unschedule`, or `reschedule`.
    pub operation: String,
    pub node_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub preempted_agents: Vec<String>,
}

/// A partial request supplied to `reschedule`; unset fields are taken from
/// the agent's checkpoint.
#[derive(Debug, Clone, Default)]
pub struct ReschedulePartial {
    pub requirements: Option<ResourceSpec>,
    pub affinity: Option<AgentAffinity>,
    pub priority: Option<AgentPriority>,
    pub preferred_nodes: Option<Vec<String>>,
    pub deadline_secs: Option<u64>,
}

/// The scheduler core.
pub struct Scheduler {
    config: SchedulerConfig,
    index: Arc<ResourceIndex>,
    planner: Arc<PreemptionPlanner>,
    priorities: Arc<PriorityDirectory>,
    bus: Arc<EventBus>,
    audit: Arc<AuditLog>,
    decisions: RwLock<VecDeque<SchedulingDecision>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        index: Arc<ResourceIndex>,
        planner: Arc<PreemptionPlanner>,
        priorities: Arc<PriorityDirectory>,
        bus: Arc<EventBus>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            index,
            planner,
            priorities,
            bus,
            audit,
            decisions: RwLock::new(VecDeque::new()),
        }
    }

    /// Shared handle to the agent-priority table.
    pub fn priorities(&self) -> Arc<PriorityDirectory> {
        Arc::clone(&self.priorities)
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Place an agent somewhere in the fleet.
    pub async fn schedule(&self, request: SchedulingRequest) -> SchedulingResult {
        let agent_id = request.agent.agent_id.clone();
        if let Err(message) = request.validate() {
            let error = ScheduleError::Validation(message);
            return self.finish_failure("schedule", &agent_id, &error).await;
        }

        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Scheduling,
            EventPayload::SchedulingRequested {
                agent_id: agent_id.clone(),
            },
        );
        let priority = request.priority.unwrap_or_default();
        self.priorities.set(&agent_id, priority);

        let deadline = request
            .deadline_secs
            .unwrap_or(self.config.default_deadline_secs);

        let attempt = self.attempt(&request, priority);
        match timeout(Duration::from_secs(deadline), attempt).await {
            Ok(Ok(placement)) => self.finish_success("schedule", &request, placement).await,
            Ok(Err(error)) => {
                // Keep the entry if the agent holds a placement from an
                // earlier request; this attempt never owned it.
                if self.index.node_of(&agent_id).await.is_none() {
                    self.priorities.forget(&agent_id);
                }
                self.finish_failure("schedule", &agent_id, &error).await
            }
            Err(_elapsed) => {
                // The attempt was cancelled mid-flight; roll back any
                // allocation it committed before the deadline hit.
                if self.index.node_of(&agent_id).await.is_some() {
                    self.index.release(&agent_id).await;
                }
                self.priorities.forget(&agent_id);
                let error = ScheduleError::DeadlineExceeded(deadline);
                self.finish_failure("schedule", &agent_id, &error).await
            }
        }
    }

    /// Release an agent's placement and forget its priority entry.
    pub async fn unschedule(&self, agent_id: &str) {
        let node_id = self.index.node_of(agent_id).await;
        let released = self.index.release(agent_id).await;
        self.priorities.forget(agent_id);
        if released {
            self.bus.emit(
                EventSeverity::Info,
                EventCategory::Scheduling,
                EventPayload::SchedulingUnscheduled {
                    agent_id: agent_id.to_string(),
                    node_id: node_id.clone(),
                },
            );
        }
        self.record_decision(SchedulingDecision {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            operation: "unschedule".to_string(),
            node_id,
            success: released,
            error: (!released).then(|| "not-placed".to_string()),
            preempted_agents: Vec::new(),
        })
        .await;
    }

    /// Resume a preempted agent: consume its checkpoint, then defer to
    /// [`schedule`](Self::schedule) with the supplied partial request.
    pub async fn reschedule(&self, agent_id: &str, partial: ReschedulePartial) -> SchedulingResult {
        let Some(checkpoint) = self.planner.resume(agent_id).await else {
            let error = ScheduleError::NoCheckpoint(agent_id.to_string());
            return self.finish_failure("reschedule", agent_id, &error).await;
        };

        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Scheduling,
            EventPayload::SchedulingResumed {
                agent_id: agent_id.to_string(),
            },
        );

        let request = SchedulingRequest {
            agent: crate::domain::models::AgentSpec {
                agent_id: agent_id.to_string(),
                labels: checkpoint.labels.clone(),
            },
            requirements: partial.requirements.unwrap_or(checkpoint.resources),
            affinity: partial.affinity,
            priority: partial.priority,
            preferred_nodes: partial.preferred_nodes,
            deadline_secs: partial.deadline_secs,
        };
        self.schedule(request).await
    }

    /// The most recent decisions, oldest first.
    pub async fn decisions(&self) -> Vec<SchedulingDecision> {
        self.decisions.read().await.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Placement attempt
    // -------------------------------------------------------------------------

    async fn attempt(
        &self,
        request: &SchedulingRequest,
        priority: AgentPriority,
    ) -> Result<Placement, ScheduleError> {
        let mut nodes = self.index.live_healthy().await;
        if nodes.is_empty() {
            return Err(ScheduleError::NoHealthyNodes);
        }

        if let Some(preferred) = &request.preferred_nodes {
            nodes.retain(|node| preferred.contains(&node.node_id));
            if nodes.is_empty() {
                return Err(ScheduleError::NoPreferredNodes);
            }
        }

        let ranked = AffinityEvaluator::rank(
            &request.agent.labels,
            &nodes,
            request.affinity.as_ref(),
        );
        if ranked.is_empty() {
            return Err(ScheduleError::AffinityEliminatesAll);
        }
        let ordered = self.order_candidates(ranked);

        if let Some(placement) = self.walk(&ordered, request, &[]).await {
            return Ok(placement);
        }

        if !self.config.preemption_enabled {
            return Err(ScheduleError::InsufficientResources);
        }

        let target_nodes: Vec<_> = ordered.iter().map(|r| r.node.clone()).collect();
        let outcome = self
            .planner
            .preempt_for_resources(
                &request.agent.agent_id,
                priority,
                &request.requirements,
                &target_nodes,
            )
            .await
            .map_err(|error| match error {
                ScheduleError::PreemptionInsufficient => ScheduleError::PreemptionInsufficient,
                // Disabled planner or Never-policy requester: the capacity
                // failure stands as-is.
                _ => ScheduleError::InsufficientResources,
            })?;

        // One retry on the same ranking now that resources are freed.
        self.walk(&ordered, request, &outcome.victims)
            .await
            .ok_or(ScheduleError::PreemptionInsufficient)
    }

    /// Walk candidates in order, attempting allocation on each with capacity.
    async fn walk(
        &self,
        ordered: &[RankedNode],
        request: &SchedulingRequest,
        preempted: &[String],
    ) -> Option<Placement> {
        for candidate in ordered {
            let node_id = &candidate.node.node_id;
            if !self.index.has_capacity(node_id, &request.requirements).await {
                continue;
            }
            if self
                .index
                .allocate(&request.agent, node_id, &request.requirements)
                .await
            {
                return Some(Placement {
                    node_id: node_id.clone(),
                    affinity_score: candidate.score,
                    preempted_agents: preempted.to_vec(),
                });
            }
        }
        None
    }

    /// Stable re-sort: affinity score stays primary, the bin-packing strategy
    /// breaks ties among equal scores.
    fn order_candidates(&self, mut ranked: Vec<RankedNode>) -> Vec<RankedNode> {
        use std::cmp::Ordering;
        let strategy = self.config.strategy;
        if strategy == BinPackingStrategy::FirstFit {
            return ranked;
        }
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| match strategy {
                    BinPackingStrategy::BestFit => b
                        .node
                        .utilization()
                        .overall
                        .partial_cmp(&a.node.utilization().overall)
                        .unwrap_or(Ordering::Equal),
                    BinPackingStrategy::WorstFit => a
                        .node
                        .utilization()
                        .overall
                        .partial_cmp(&b.node.utilization().overall)
                        .unwrap_or(Ordering::Equal),
                    BinPackingStrategy::Spread => a.node.agents.len().cmp(&b.node.agents.len()),
                    BinPackingStrategy::FirstFit => Ordering::Equal,
                })
        });
        ranked
    }

    // -------------------------------------------------------------------------
    // Outcome recording
    // -------------------------------------------------------------------------

    async fn finish_success(
        &self,
        operation: &str,
        request: &SchedulingRequest,
        placement: Placement,
    ) -> SchedulingResult {
        let agent_id = &request.agent.agent_id;
        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Scheduling,
            EventPayload::SchedulingSucceeded {
                agent_id: agent_id.clone(),
                node_id: placement.node_id.clone(),
                affinity_score: placement.affinity_score,
                preempted_agents: placement.preempted_agents.clone(),
            },
        );
        self.audit
            .record(
                AuditLevel::Info,
                AuditCategory::Scheduling,
                Some(agent_id.clone()),
                None,
                "schedule.placed",
                format!(
                    "placed on {} (score {:.0}, {} preempted)",
                    placement.node_id,
                    placement.affinity_score,
                    placement.preempted_agents.len()
                ),
            )
            .await;
        self.record_decision(SchedulingDecision {
            timestamp: Utc::now(),
            agent_id: agent_id.clone(),
            operation: operation.to_string(),
            node_id: Some(placement.node_id.clone()),
            success: true,
            error: None,
            preempted_agents: placement.preempted_agents.clone(),
        })
        .await;
        tracing::info!(
            agent_id,
            node_id = %placement.node_id,
            score = placement.affinity_score,
            "agent placed"
        );
        SchedulingResult::placed(
            agent_id,
            placement.node_id,
            request.requirements.clone(),
            placement.affinity_score,
            placement.preempted_agents,
        )
    }

    async fn finish_failure(
        &self,
        operation: &str,
        agent_id: &str,
        error: &ScheduleError,
    ) -> SchedulingResult {
        self.bus.emit(
            EventSeverity::Warning,
            EventCategory::Scheduling,
            EventPayload::SchedulingFailed {
                agent_id: agent_id.to_string(),
                reason: error.code().to_string(),
            },
        );
        self.audit
            .record(
                AuditLevel::Warning,
                AuditCategory::Scheduling,
                Some(agent_id.to_string()),
                None,
                format!("schedule.{}", error.code()),
                error.to_string(),
            )
            .await;
        self.record_decision(SchedulingDecision {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            operation: operation.to_string(),
            node_id: None,
            success: false,
            error: Some(error.code().to_string()),
            preempted_agents: Vec::new(),
        })
        .await;
        tracing::warn!(agent_id, error = %error, "scheduling failed");
        SchedulingResult::failed(agent_id, error.code())
    }

    async fn record_decision(&self, decision: SchedulingDecision) {
        let mut decisions = self.decisions.write().await;
        if decisions.len() >= self.config.decision_log_entries {
            decisions.pop_front();
        }
        decisions.push_back(decision);
    }
}

struct Placement {
    node_id: String,
    affinity_score: f64,
    preempted_agents: Vec<String>,
}
