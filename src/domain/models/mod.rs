//! Domain models for the fleet control plane.

pub mod affinity;
pub mod budget;
pub mod node;
pub mod priority;
pub mod resources;
pub mod scheduling;
pub mod session;

pub use affinity::{
    AffinityRule, AgentAffinity, LabelSelector, MatchExpression, RuleStrength, SelectorOperator,
};
pub use budget::{
    default_ladder, BudgetAlert, BudgetConfig, BudgetConfigPatch, BudgetPeriod, BudgetScopeKind,
    BudgetTracking, CostUsage, NotificationChannel, ThresholdAction, ThresholdConfig,
    ThresholdEvent, TokenUsage,
};
pub use node::{Node, PlacedAgent, Utilization, DEFAULT_NODE_TTL_SECS};
pub use priority::{AgentPriority, PreemptionPolicy, PriorityClass};
pub use resources::ResourceSpec;
pub use scheduling::{AgentSpec, BinPackingStrategy, SchedulingRequest, SchedulingResult};
pub use session::{SessionEvent, SessionInfo, SessionState, SpawnOptions};
