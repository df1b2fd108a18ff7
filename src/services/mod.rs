//! Core services of the fleet control plane.

pub mod affinity_evaluator;
pub mod audit_log;
pub mod block_registry;
pub mod budget_engine;
pub mod cost_calculator;
pub mod event_bus;
pub mod preemption;
pub mod resource_index;
pub mod scheduler;
pub mod session_bridge;
pub mod supervisor;
pub mod threshold;

pub use affinity_evaluator::{AffinityEvaluation, AffinityEvaluator, RankedNode, RuleGroup, RuleResult};
pub use audit_log::{AuditCategory, AuditEntry, AuditFilter, AuditLevel, AuditLog, AuditLogConfig};
pub use block_registry::{BlockRegistry, BlockedAgent};
pub use budget_engine::{
    AgentReportRow, BudgetEngine, BudgetEngineConfig, BudgetReport, ProjectStatus, ReportPeriod,
    TrackingUsage,
};
pub use cost_calculator::{CostCalculator, ModelPricing};
pub use event_bus::{
    EventBus, EventBusConfig, EventCategory, EventId, EventPayload, EventSeverity, FleetEvent,
    SequenceNumber,
};
pub use preemption::{
    Checkpoint, PreemptionConfig, PreemptionOutcome, PreemptionPlanner, PreemptionRecord,
    ResourceReleaser,
};
pub use resource_index::{ClusterUtilization, ResourceIndex, ResourceIndexConfig};
pub use scheduler::{
    PriorityDirectory, ReschedulePartial, Scheduler, SchedulerConfig, SchedulingDecision,
};
pub use session_bridge::{LoopbackGateway, SessionBridge, SessionGateway};
pub use supervisor::{ControlPlane, ControlPlaneConfig, Supervisor, SupervisorConfig};
pub use threshold::{ThresholdLadder, TriggeredThreshold};
