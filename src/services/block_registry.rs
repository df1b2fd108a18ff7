//! Registry of agents blocked pending human approval.
//!
//! A block is effective iff it is unapproved or its approval has expired; an
//! expired approval re-opens the block without a new threshold fire. The
//! registry is pure state: approval UX, notification, and session pausing are
//! collaborators.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Block state for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedAgent {
    pub agent_id: String,
    /// The budget tracking whose threshold caused the block.
    pub budget_id: Uuid,
    pub blocked_at: DateTime<Utc>,
    pub threshold_pct: f64,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_expires_at: Option<DateTime<Utc>>,
    /// Set when the block came from a kill action; terminal rather than pausable.
    #[serde(default)]
    pub killed: bool,
}

impl BlockedAgent {
    /// An approved-and-unexpired block is not effective.
    fn is_effective(&self, now: DateTime<Utc>) -> bool {
        if !self.approved {
            return true;
        }
        match self.approval_expires_at {
            Some(expires) => expires <= now,
            None => false,
        }
    }
}

/// Tracks which agents are currently blocked awaiting approval.
pub struct BlockRegistry {
    blocks: RwLock<HashMap<String, BlockedAgent>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, BlockedAgent>> {
        match self.blocks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BlockedAgent>> {
        match self.blocks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert (or overwrite) a block for `agent_id`.
    pub fn block(&self, agent_id: impl Into<String>, budget_id: Uuid, threshold_pct: f64) {
        self.insert(agent_id.into(), budget_id, threshold_pct, false);
    }

    /// Insert a block marked as killed: the run is terminal, not pausable.
    pub fn block_killed(&self, agent_id: impl Into<String>, budget_id: Uuid, threshold_pct: f64) {
        self.insert(agent_id.into(), budget_id, threshold_pct, true);
    }

    fn insert(&self, agent_id: String, budget_id: Uuid, threshold_pct: f64, killed: bool) {
        let record = BlockedAgent {
            agent_id: agent_id.clone(),
            budget_id,
            blocked_at: Utc::now(),
            threshold_pct,
            approved: false,
            approved_by: None,
            approved_at: None,
            approval_expires_at: None,
            killed,
        };
        self.write().insert(agent_id, record);
    }

    /// True iff an effective block exists for `agent_id`.
    pub fn is_blocked(&self, agent_id: &str) -> bool {
        let now = Utc::now();
        self.read()
            .get(agent_id)
            .is_some_and(|record| record.is_effective(now))
    }

    /// Approve a block for `duration_minutes`. Returns false for unknown agents.
    pub fn approve(&self, agent_id: &str, approver: impl Into<String>, duration_minutes: i64) -> bool {
        let mut blocks = self.write();
        let Some(record) = blocks.get_mut(agent_id) else {
            return false;
        };
        let now = Utc::now();
        record.approved = true;
        record.approved_by = Some(approver.into());
        record.approved_at = Some(now);
        record.approval_expires_at = Some(now + Duration::minutes(duration_minutes));
        true
    }

    /// Delete the block record entirely. Returns the removed record if any.
    pub fn unblock(&self, agent_id: &str) -> Option<BlockedAgent> {
        self.write().remove(agent_id)
    }

    /// All effective blocks; approved-but-unexpired entries are filtered out.
    pub fn list(&self) -> Vec<BlockedAgent> {
        let now = Utc::now();
        let mut blocks: Vec<BlockedAgent> = self
            .read()
            .values()
            .filter(|record| record.is_effective(now))
            .cloned()
            .collect();
        blocks.sort_by(|a, b| a.blocked_at.cmp(&b.blocked_at));
        blocks
    }

    /// The raw record for `agent_id`, effective or not.
    pub fn get(&self, agent_id: &str) -> Option<BlockedAgent> {
        self.read().get(agent_id).cloned()
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_and_is_blocked() {
        let registry = BlockRegistry::new();
        let budget_id = Uuid::new_v4();
        assert!(!registry.is_blocked("a1"));

        registry.block("a1", budget_id, 90.0);
        assert!(registry.is_blocked("a1"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_approval_lifts_block() {
        let registry = BlockRegistry::new();
        registry.block("a1", Uuid::new_v4(), 90.0);

        assert!(registry.approve("a1", "alice", 30));
        assert!(!registry.is_blocked("a1"));
        // Approved-but-unexpired entries are filtered from list().
        assert!(registry.list().is_empty());

        let record = registry.get("a1").unwrap();
        assert_eq!(record.approved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_expired_approval_reopens_block() {
        let registry = BlockRegistry::new();
        registry.block("a1", Uuid::new_v4(), 90.0);
        registry.approve("a1", "alice", 30);

        // Backdate the expiry past now: the block re-opens without a new fire.
        {
            let mut blocks = registry.blocks.write().unwrap();
            let record = blocks.get_mut("a1").unwrap();
            record.approval_expires_at = Some(Utc::now() - Duration::minutes(1));
        }
        assert!(registry.is_blocked("a1"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_unblock_deletes() {
        let registry = BlockRegistry::new();
        registry.block("a1", Uuid::new_v4(), 90.0);
        let removed = registry.unblock("a1");
        assert!(removed.is_some());
        assert!(!registry.is_blocked("a1"));
        assert!(registry.unblock("a1").is_none());
    }

    #[test]
    fn test_approve_unknown_agent() {
        let registry = BlockRegistry::new();
        assert!(!registry.approve("ghost", "alice", 30));
    }

    #[test]
    fn test_killed_block_is_marked() {
        let registry = BlockRegistry::new();
        registry.block_killed("a1", Uuid::new_v4(), 100.0);
        let record = registry.get("a1").unwrap();
        assert!(record.killed);
        assert!(registry.is_blocked("a1"));
    }
}
