//! Bounded audit log for budget and scheduling decisions.
//!
//! Records threshold fires, kills, compliance entries, and placement
//! decisions for post-hoc analysis. Retention is a fixed-size ring;
//! oldest entries are evicted first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Configuration for the audit log service.
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    /// Maximum entries to keep in memory.
    pub max_entries: usize,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

/// Audit entry level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

/// Category of audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    /// Threshold fires and budget actions.
    Budget,
    /// Compliance records appended by the audit threshold action.
    Compliance,
    /// Placement and preemption decisions.
    Scheduling,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub category: AuditCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<Uuid>,
    /// Short machine-readable action name, e.g. `threshold.block`.
    pub action: String,
    pub message: String,
}

/// Filter for querying the log.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub min_level: Option<AuditLevel>,
    pub category: Option<AuditCategory>,
    pub agent_id: Option<String>,
    pub limit: Option<usize>,
}

/// Bounded in-memory audit log.
pub struct AuditLog {
    config: AuditLogConfig,
    entries: RwLock<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(config: AuditLogConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Append an entry, evicting the oldest past the retention bound.
    pub async fn record(
        &self,
        level: AuditLevel,
        category: AuditCategory,
        agent_id: Option<String>,
        budget_id: Option<Uuid>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            level,
            category,
            agent_id,
            budget_id,
            action: action.into(),
            message: message.into(),
        };
        let mut entries = self.entries.write().await;
        if entries.len() >= self.config.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Query entries newest-last, applying the filter.
    pub async fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| {
                filter.min_level.is_none_or(|min| entry.level >= min)
                    && filter.category.is_none_or(|c| entry.category == c)
                    && filter
                        .agent_id
                        .as_ref()
                        .is_none_or(|a| entry.agent_id.as_ref() == Some(a))
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    /// Total retained entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True iff no entries are retained.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AuditLogConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_query() {
        let log = AuditLog::default();
        log.record(
            AuditLevel::Warning,
            AuditCategory::Budget,
            Some("a1".to_string()),
            None,
            "threshold.warn",
            "usage at 55%",
        )
        .await;

        let all = log.query(&AuditFilter::default()).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action, "threshold.warn");
    }

    #[tokio::test]
    async fn test_retention_bound_evicts_oldest() {
        let log = AuditLog::new(AuditLogConfig { max_entries: 3 });
        for i in 0..5 {
            log.record(
                AuditLevel::Info,
                AuditCategory::Scheduling,
                None,
                None,
                format!("decision.{i}"),
                "placed",
            )
            .await;
        }
        let all = log.query(&AuditFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, "decision.2");
        assert_eq!(all[2].action, "decision.4");
    }

    #[tokio::test]
    async fn test_filter_by_level_and_agent() {
        let log = AuditLog::default();
        log.record(AuditLevel::Info, AuditCategory::Budget, Some("a1".into()), None, "x", "m")
            .await;
        log.record(
            AuditLevel::Critical,
            AuditCategory::Compliance,
            Some("a2".into()),
            None,
            "y",
            "m",
        )
        .await;

        let filter = AuditFilter {
            min_level: Some(AuditLevel::Warning),
            ..AuditFilter::default()
        };
        let critical = log.query(&filter).await;
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].agent_id.as_deref(), Some("a2"));

        let filter = AuditFilter {
            agent_id: Some("a1".to_string()),
            ..AuditFilter::default()
        };
        assert_eq!(log.query(&filter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_returns_newest() {
        let log = AuditLog::default();
        for i in 0..4 {
            log.record(AuditLevel::Info, AuditCategory::Budget, None, None, format!("a{i}"), "m")
                .await;
        }
        let filter = AuditFilter {
            limit: Some(2),
            ..AuditFilter::default()
        };
        let newest = log.query(&filter).await;
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].action, "a2");
        assert_eq!(newest[1].action, "a3");
    }
}
