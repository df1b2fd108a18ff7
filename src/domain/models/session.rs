//! Session records exchanged with the external session gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Observable state of an external session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
}

impl SessionState {
    /// True iff the session cannot transition further.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

/// A state or usage change reported by the session gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started,
    Paused,
    Resumed,
    Completed,
    Failed { error: String },
    Killed { force: bool },
    /// Periodic usage report for the run.
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    },
}

/// Options for spawning a new external session for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Opaque gateway-side options (working directory, template, etc.).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SpawnOptions {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }
}

/// A live mapping entry the bridge keeps per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_id: String,
    pub state: SessionState,
    pub spawned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Killed.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Paused.is_terminal());
    }
}
