//! Priority classes and preemption policies for scheduled agents.

use serde::{Deserialize, Serialize};

/// Priority class of an agent. Comparison is numeric on the class value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Batch,
    Low,
    Normal,
    High,
    Critical,
}

impl PriorityClass {
    /// Numeric value used for ordering and for the preemption priority gap.
    pub const fn value(self) -> u32 {
        match self {
            Self::Batch => 1,
            Self::Low => 10,
            Self::Normal => 100,
            Self::High => 500,
            Self::Critical => 1000,
        }
    }
}

impl PartialOrd for PriorityClass {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityClass {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

impl std::fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Whether an agent may displace lower-priority agents, and whether it may
/// itself be displaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreemptionPolicy {
    /// May preempt strictly lower-priority agents; may itself be preempted.
    PreemptLowerPriority,
    /// Never preempted, regardless of class; also never preempts others.
    Never,
}

/// The priority record the scheduler keeps per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPriority {
    pub class: PriorityClass,
    pub policy: PreemptionPolicy,
}

impl Default for AgentPriority {
    fn default() -> Self {
        Self {
            class: PriorityClass::Normal,
            policy: PreemptionPolicy::PreemptLowerPriority,
        }
    }
}

impl AgentPriority {
    pub fn new(class: PriorityClass, policy: PreemptionPolicy) -> Self {
        Self { class, policy }
    }

    /// True iff this agent can be evicted at all.
    pub const fn is_preemptible(&self) -> bool {
        matches!(self.policy, PreemptionPolicy::PreemptLowerPriority)
    }
}
