//! Control-plane assembly and the event wiring between subsystems.
//!
//! The budget engine and the placement side never call each other directly;
//! coupling is through bus events. The supervisor subscribes once and
//! translates: `token.usage` feeds the budget engine, kill requests release
//! resources and terminate sessions, blocks pause sessions. It also runs the
//! interruptible background passes (stale-node sweep, cooldown pruning) and
//! exposes the approval entry points the human-approval collaborator calls.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::infrastructure::persistence::JsonBudgetStore;
use crate::services::audit_log::{AuditLog, AuditLogConfig};
use crate::services::block_registry::BlockRegistry;
use crate::services::budget_engine::{BudgetEngine, BudgetEngineConfig};
use crate::services::cost_calculator::CostCalculator;
use crate::services::event_bus::{EventBus, EventBusConfig, EventCategory, EventPayload, EventSeverity};
use crate::services::preemption::{PreemptionConfig, PreemptionPlanner, ResourceReleaser};
use crate::services::resource_index::{ResourceIndex, ResourceIndexConfig};
use crate::services::scheduler::{PriorityDirectory, Scheduler, SchedulerConfig};
use crate::services::session_bridge::{SessionBridge, SessionGateway};
use crate::services::threshold::ThresholdLadder;

/// Timer settings for the supervisor's background passes.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Seconds between stale-node sweeps.
    pub stale_sweep_interval_secs: u64,
    /// Seconds between cooldown-table prunes.
    pub cooldown_prune_interval_secs: u64,
    /// Cooldown entries older than this are dropped by the prune pass.
    pub cooldown_max_age_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stale_sweep_interval_secs: 60,
            cooldown_prune_interval_secs: 300,
            cooldown_max_age_secs: 3600,
        }
    }
}

/// Configuration bundle for assembling a control plane.
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneConfig {
    pub events: EventBusConfig,
    pub index: ResourceIndexConfig,
    pub scheduler: SchedulerConfig,
    pub preemption: PreemptionConfig,
    pub budget: BudgetEngineConfig,
    pub audit: AuditLogConfig,
    pub supervisor: SupervisorConfig,
}

/// The assembled control plane: one value constructed at startup and passed
/// through dependencies, never a process-wide singleton.
pub struct ControlPlane {
    pub bus: Arc<EventBus>,
    pub index: Arc<ResourceIndex>,
    pub scheduler: Arc<Scheduler>,
    pub planner: Arc<PreemptionPlanner>,
    pub engine: Arc<BudgetEngine>,
    pub bridge: Arc<SessionBridge>,
    pub blocks: Arc<BlockRegistry>,
    pub audit: Arc<AuditLog>,
}

impl ControlPlane {
    /// Wire every subsystem together. `store` is the budgets.json location;
    /// pass `None` for a purely in-memory plane.
    pub fn new(
        config: ControlPlaneConfig,
        gateway: Arc<dyn SessionGateway>,
        store: Option<JsonBudgetStore>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.events));
        let audit = Arc::new(AuditLog::new(config.audit));
        let blocks = Arc::new(BlockRegistry::new());
        let index = Arc::new(ResourceIndex::new(config.index, Arc::clone(&bus)));
        let priorities = Arc::new(PriorityDirectory::new());
        let planner = Arc::new(PreemptionPlanner::new(
            config.preemption,
            Arc::clone(&index) as Arc<dyn ResourceReleaser>,
            Arc::clone(&priorities),
            Arc::clone(&bus),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler,
            Arc::clone(&index),
            Arc::clone(&planner),
            priorities,
            Arc::clone(&bus),
            Arc::clone(&audit),
        ));
        let engine = Arc::new(BudgetEngine::new(
            config.budget,
            Arc::new(CostCalculator::new()),
            Arc::new(ThresholdLadder::new()),
            Arc::clone(&blocks),
            Arc::clone(&audit),
            Arc::clone(&bus),
            store,
        ));
        let bridge = Arc::new(SessionBridge::new(gateway, Arc::clone(&bus)));
        Self {
            bus,
            index,
            scheduler,
            planner,
            engine,
            bridge,
            blocks,
            audit,
        }
    }
}

/// Runs the event pump and background passes over a control plane.
pub struct Supervisor {
    plane: Arc<ControlPlane>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(plane: Arc<ControlPlane>, config: SupervisorConfig) -> Self {
        Self { plane, config }
    }

    /// Spawn the event pump and periodic passes. The returned handles run
    /// until the process exits; abort them to shut down.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_event_pump(),
            self.spawn_stale_sweep(),
            self.spawn_cooldown_prune(),
        ]
    }

    // -------------------------------------------------------------------------
    // Approval entry points (called by the human-approval collaborator)
    // -------------------------------------------------------------------------

    /// Approve a blocked agent for `duration_minutes` and resume its session.
    pub async fn approve_agent(
        &self,
        agent_id: &str,
        approver: &str,
        duration_minutes: i64,
    ) -> bool {
        if !self.plane.blocks.approve(agent_id, approver, duration_minutes) {
            return false;
        }
        self.plane.bus.emit(
            EventSeverity::Info,
            EventCategory::Budget,
            EventPayload::AgentUnblocked {
                agent_id: agent_id.to_string(),
                approved_by: Some(approver.to_string()),
            },
        );
        if let Err(error) = self.plane.bridge.resume_session(agent_id).await {
            tracing::warn!(agent_id, %error, "could not resume session after approval");
        }
        true
    }

    /// Remove a block entirely and resume the agent's session.
    pub async fn unblock_agent(&self, agent_id: &str) -> bool {
        if self.plane.blocks.unblock(agent_id).is_none() {
            return false;
        }
        self.plane.bus.emit(
            EventSeverity::Info,
            EventCategory::Budget,
            EventPayload::AgentUnblocked {
                agent_id: agent_id.to_string(),
                approved_by: None,
            },
        );
        if let Err(error) = self.plane.bridge.resume_session(agent_id).await {
            tracing::warn!(agent_id, %error, "could not resume session after unblock");
        }
        true
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    fn spawn_event_pump(&self) -> JoinHandle<()> {
        let plane = Arc::clone(&self.plane);
        let mut rx = plane.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event pump lagged, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                Self::dispatch(&plane, event.payload).await;
            }
        })
    }

    /// React to one event. Errors are logged, never propagated: a failing
    /// handler must not stall the pump.
    async fn dispatch(plane: &ControlPlane, payload: EventPayload) {
        match payload {
            EventPayload::TokenUsage {
                agent_id,
                prompt_tokens,
                completion_tokens,
                ..
            } => {
                plane
                    .engine
                    .record_tokens_for_agent(&agent_id, prompt_tokens, completion_tokens, None)
                    .await;
            }
            EventPayload::AgentKillRequested { agent_id, .. } => {
                plane.scheduler.unschedule(&agent_id).await;
                if let Err(error) = plane.bridge.kill_session(&agent_id, true).await {
                    tracing::error!(agent_id, %error, "kill propagation failed");
                }
            }
            EventPayload::AgentBlocked { agent_id, .. } => {
                if let Err(error) = plane.bridge.pause_session(&agent_id).await {
                    tracing::warn!(agent_id, %error, "could not pause blocked agent");
                }
            }
            _ => {}
        }
    }

    fn spawn_stale_sweep(&self) -> JoinHandle<()> {
        let index = Arc::clone(&self.plane.index);
        let period = Duration::from_secs(self.config.stale_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let removed = index.purge_stale().await;
                if !removed.is_empty() {
                    tracing::warn!(count = removed.len(), "stale nodes evicted");
                }
            }
        })
    }

    fn spawn_cooldown_prune(&self) -> JoinHandle<()> {
        let ladder = self.plane.engine.ladder();
        let period = Duration::from_secs(self.config.cooldown_prune_interval_secs);
        let max_age = self.config.cooldown_max_age_secs;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ladder.prune_stale(max_age);
            }
        })
    }
}
