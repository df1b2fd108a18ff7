//! Domain error types for the Hivemind control plane
//!
//! This module defines all error types using thiserror for structured error handling.
//! Each error enum represents errors from a specific core subsystem. The core never
//! aborts the process: every public operation surfaces one of these as a typed result.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the placement scheduler and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// No registered node is both live and healthy
    #[error("No healthy nodes available")]
    NoHealthyNodes,

    /// The request named preferred nodes and none of them exist or are healthy
    #[error("None of the preferred nodes are available")]
    NoPreferredNodes,

    /// Hard affinity constraints eliminated every candidate node
    #[error("Affinity constraints eliminate all candidate nodes")]
    AffinityEliminatesAll,

    /// No candidate node has capacity for the requested resources
    #[error("Insufficient resources on all candidate nodes")]
    InsufficientResources,

    /// Preemption ran but could not free enough resources
    #[error("Preemption could not free sufficient resources")]
    PreemptionInsufficient,

    /// Preemption is disabled or forbidden for this requester
    #[error("Preemption is not permitted for this request")]
    PreemptionDisabled,

    /// The scheduling deadline expired before a placement was committed
    #[error("Scheduling deadline of {0} seconds expired")]
    DeadlineExceeded(u64),

    /// Malformed request: negative resources, conflicting affinity shapes, etc.
    #[error("Invalid scheduling request: {0}")]
    Validation(String),

    /// No checkpoint exists for the agent being rescheduled
    #[error("No checkpoint recorded for agent {0}")]
    NoCheckpoint(String),
}

impl ScheduleError {
    /// Returns true if the caller may retry the same request later
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyNodes
                | Self::InsufficientResources
                | Self::PreemptionInsufficient
                | Self::DeadlineExceeded(_)
        )
    }

    /// The stable machine-readable code for this failure, carried in
    /// `scheduling.failed` events and `SchedulingResult::error`.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoHealthyNodes => "no-healthy-nodes",
            Self::NoPreferredNodes => "no-preferred-nodes",
            Self::AffinityEliminatesAll => "affinity-eliminates-all",
            Self::InsufficientResources => "insufficient-resources",
            Self::PreemptionInsufficient => "preemption-insufficient",
            Self::PreemptionDisabled => "preemption-disabled",
            Self::DeadlineExceeded(_) => "deadline-exceeded",
            Self::Validation(_) => "validation",
            Self::NoCheckpoint(_) => "no-checkpoint",
        }
    }
}

/// Errors surfaced by the budget engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    /// No live tracking exists for the given budget id
    #[error("Unknown budget tracking: {0}")]
    UnknownBudget(Uuid),

    /// Malformed configuration: zero max-cost, out-of-range reset anchor, etc.
    #[error("Invalid budget configuration: {0}")]
    Validation(String),

    /// No alert with the given id is registered
    #[error("Unknown alert: {0}")]
    UnknownAlert(Uuid),
}

/// Errors surfaced by the session bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The agent has no active session mapping
    #[error("No session mapped for agent {0}")]
    NoSessionForAgent(String),

    /// The agent already has an active session; the mapping is a partial bijection
    #[error("Agent {0} already has an active session")]
    AgentAlreadyMapped(String),

    /// The external session gateway failed or is unreachable
    #[error("Session gateway error: {0}")]
    Gateway(String),
}

impl SessionError {
    /// Returns true if this error is transient and could succeed on retry
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Gateway(_))
    }
}

/// Errors surfaced by the persistence layer
///
/// Durability failures are logged and do not abort in-memory updates; the
/// in-memory state stays authoritative for the rest of the process lifetime.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// I/O failure reading or writing the persisted document
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The persisted document could not be parsed
    #[error("Corrupt document at {path}: {message}")]
    Corrupt { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_codes_are_stable() {
        assert_eq!(ScheduleError::NoHealthyNodes.code(), "no-healthy-nodes");
        assert_eq!(ScheduleError::NoPreferredNodes.code(), "no-preferred-nodes");
        assert_eq!(
            ScheduleError::AffinityEliminatesAll.code(),
            "affinity-eliminates-all"
        );
        assert_eq!(
            ScheduleError::InsufficientResources.code(),
            "insufficient-resources"
        );
        assert_eq!(
            ScheduleError::PreemptionInsufficient.code(),
            "preemption-insufficient"
        );
    }

    #[test]
    fn test_schedule_error_retryability() {
        assert!(ScheduleError::InsufficientResources.is_retryable());
        assert!(ScheduleError::NoHealthyNodes.is_retryable());
        assert!(!ScheduleError::Validation("bad".into()).is_retryable());
        assert!(!ScheduleError::AffinityEliminatesAll.is_retryable());
    }

    #[test]
    fn test_budget_error_display() {
        let id = Uuid::new_v4();
        let err = BudgetError::UnknownBudget(id);
        assert_eq!(err.to_string(), format!("Unknown budget tracking: {id}"));
    }

    #[test]
    fn test_session_error_transience() {
        assert!(SessionError::Gateway("connection refused".into()).is_transient());
        assert!(!SessionError::NoSessionForAgent("a1".into()).is_transient());
    }
}
