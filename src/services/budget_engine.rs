//! Budget engine: per-run cost accounting with staged threshold enforcement.
//!
//! Each active agent run has one live tracking record guarded by its own
//! lock; `record_tokens` calls for a single budget id are linearized, while
//! distinct budgets interleave freely. Threshold actions are executed
//! synchronously inside the recording call: warn, notify, block, kill, and
//! audit (which implies kill). Configurations and alerts persist through the
//! JSON store; tracking state never survives a restart.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::domain::error::BudgetError;
use crate::domain::models::{
    BudgetAlert, BudgetConfig, BudgetConfigPatch, BudgetScopeKind, BudgetTracking, CostUsage,
    ThresholdEvent, TokenUsage,
};
use crate::infrastructure::persistence::JsonBudgetStore;
use crate::services::audit_log::{AuditCategory, AuditLevel, AuditLog};
use crate::services::block_registry::BlockRegistry;
use crate::services::cost_calculator::CostCalculator;
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};
use crate::services::threshold::{ThresholdLadder, TriggeredThreshold};

/// Engine-level defaults applied when no configuration matches a new tracking.
#[derive(Debug, Clone)]
pub struct BudgetEngineConfig {
    pub default_max_tokens: u64,
    pub default_max_cost: f64,
}

impl Default for BudgetEngineConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 10_000_000,
            default_max_cost: 100.0,
        }
    }
}

/// Usage summary returned by [`BudgetEngine::usage`].
#[derive(Debug, Clone)]
pub struct TrackingUsage {
    pub budget_id: Uuid,
    pub tokens_used: TokenUsage,
    pub cost_used: CostUsage,
    pub percent_used: f64,
    pub max_tokens: u64,
    pub max_cost: f64,
}

/// Aggregate view of a project's live trackings.
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    pub trackings: Vec<BudgetTracking>,
    pub total_cost: f64,
    pub config: Option<BudgetConfig>,
}

/// Reporting window for [`BudgetEngine::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPeriod {
    Week,
    Month,
}

impl ReportPeriod {
    fn window(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Week => now - Duration::days(7),
            Self::Month => now - Duration::days(30),
        }
    }
}

/// Per-agent row of a budget report.
#[derive(Debug, Clone, Default)]
pub struct AgentReportRow {
    pub tokens: TokenUsage,
    pub cost: f64,
    pub runs: usize,
}

/// Usage report for one project over a window.
#[derive(Debug, Clone)]
pub struct BudgetReport {
    pub project_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub by_agent: HashMap<String, AgentReportRow>,
    /// Cost attributed to the calendar day each run started.
    pub by_day: BTreeMap<chrono::NaiveDate, f64>,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// Data gathered under the tracking lock, acted on after it is dropped.
struct TriggerContext {
    trigger: TriggeredThreshold,
    agent_id: String,
    project_id: String,
    percent: f64,
}

/// The budget engine.
pub struct BudgetEngine {
    config: BudgetEngineConfig,
    calculator: Arc<CostCalculator>,
    ladder: Arc<ThresholdLadder>,
    blocks: Arc<BlockRegistry>,
    audit: Arc<AuditLog>,
    bus: Arc<EventBus>,
    store: Option<JsonBudgetStore>,
    configs: RwLock<HashMap<String, BudgetConfig>>,
    alerts: RwLock<HashMap<String, Vec<BudgetAlert>>>,
    trackings: RwLock<HashMap<Uuid, Arc<Mutex<BudgetTracking>>>>,
}

impl BudgetEngine {
    pub fn new(
        config: BudgetEngineConfig,
        calculator: Arc<CostCalculator>,
        ladder: Arc<ThresholdLadder>,
        blocks: Arc<BlockRegistry>,
        audit: Arc<AuditLog>,
        bus: Arc<EventBus>,
        store: Option<JsonBudgetStore>,
    ) -> Self {
        Self {
            config,
            calculator,
            ladder,
            blocks,
            audit,
            bus,
            store,
            configs: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            trackings: RwLock::new(HashMap::new()),
        }
    }

    /// Load persisted configurations and alerts. Call once at startup.
    pub async fn load(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let document = store.load().await;
        *self.configs.write().await = document.configs;
        *self.alerts.write().await = document.alerts;
    }

    /// Shared handle to the block registry.
    pub fn blocks(&self) -> Arc<BlockRegistry> {
        Arc::clone(&self.blocks)
    }

    /// Shared handle to the threshold ladder (cooldown table).
    pub fn ladder(&self) -> Arc<ThresholdLadder> {
        Arc::clone(&self.ladder)
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Upsert the configuration for `(kind, scope)`, persisting afterwards.
    pub async fn set_config(
        &self,
        kind: BudgetScopeKind,
        scope: &str,
        patch: BudgetConfigPatch,
    ) -> Result<BudgetConfig, BudgetError> {
        let key = format!("{kind}:{scope}");
        let mut config = {
            let configs = self.configs.read().await;
            configs
                .get(&key)
                .cloned()
                .unwrap_or_else(|| self.default_config(kind, scope))
        };
        patch.apply_to(&mut config);
        config.validate().map_err(BudgetError::Validation)?;

        self.configs
            .write()
            .await
            .insert(key.clone(), config.clone());
        self.persist().await;
        tracing::info!(key, max_cost = config.max_cost, "budget config updated");
        Ok(config)
    }

    /// The stored configuration for `(kind, scope)`, if any.
    pub async fn get_config(&self, kind: BudgetScopeKind, scope: &str) -> Option<BudgetConfig> {
        self.configs
            .read()
            .await
            .get(&format!("{kind}:{scope}"))
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Tracking lifecycle
    // -------------------------------------------------------------------------

    /// Start accounting for one agent run. The most specific configuration
    /// wins: task → agent → swarm → project → engine default.
    pub async fn begin_tracking(
        &self,
        agent_id: &str,
        task_id: &str,
        project_id: &str,
        model: &str,
        swarm_id: Option<&str>,
    ) -> BudgetTracking {
        let config = self
            .resolve_config(task_id, agent_id, swarm_id, project_id)
            .await;
        let now = Utc::now();
        let tracking = BudgetTracking {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            project_id: project_id.to_string(),
            swarm_id: swarm_id.map(str::to_string),
            model: model.to_string(),
            tokens_used: TokenUsage::default(),
            cost_used: CostUsage::default(),
            started_at: now,
            last_updated: now,
            completed_at: None,
            config,
            history: Vec::new(),
            killed: false,
            kill_reason: None,
        };
        self.trackings
            .write()
            .await
            .insert(tracking.id, Arc::new(Mutex::new(tracking.clone())));
        tracing::debug!(budget_id = %tracking.id, agent_id, "tracking started");
        tracking
    }

    /// Record a token delta for `budget_id`, recompute cost, and execute any
    /// crossed threshold action. Unknown budgets warn and no-op.
    pub async fn record_tokens(
        &self,
        budget_id: Uuid,
        prompt_tokens: u64,
        completion_tokens: u64,
        model: Option<&str>,
    ) -> Option<TriggeredThreshold> {
        let Some(entry) = self.tracking_entry(budget_id).await else {
            tracing::warn!(%budget_id, "record for unknown budget");
            return None;
        };

        let context = {
            let mut tracking = entry.lock().await;
            if tracking.completed_at.is_some() {
                tracing::warn!(%budget_id, "record for finished tracking");
                return None;
            }

            let now = Utc::now();
            // A periodic budget that rolled into a new window starts clean.
            if let Some(period) = tracking.config.period {
                if tracking.last_updated < period.window_start(now) {
                    tracking.tokens_used = TokenUsage::default();
                    tracking.cost_used = CostUsage::default();
                }
            }

            let model = model.unwrap_or(&tracking.model).to_string();
            tracking.tokens_used.add(prompt_tokens, completion_tokens);
            let delta = self
                .calculator
                .calculate(&model, prompt_tokens, completion_tokens);
            tracking.cost_used.add(delta.prompt, delta.completion);
            tracking.last_updated = now;

            let percent = tracking.percent_used();
            let trigger =
                self.ladder
                    .check_with_cooldown(budget_id, percent, &tracking.config.ladder)?;

            tracking.history.push(ThresholdEvent {
                timestamp: now,
                threshold_pct: trigger.threshold_pct,
                action: trigger.action,
                message: trigger.message.clone(),
            });
            if trigger.should_kill() {
                tracking.completed_at = Some(now);
                tracking.killed = true;
                tracking.kill_reason = Some(trigger.message.clone());
            }
            TriggerContext {
                agent_id: tracking.agent_id.clone(),
                project_id: tracking.project_id.clone(),
                percent,
                trigger,
            }
        };

        self.execute_action(budget_id, &context).await;
        Some(context.trigger)
    }

    /// Route a usage delta to the agent's active tracking, if one exists.
    /// This is the entry point the token-usage event feed uses.
    pub async fn record_tokens_for_agent(
        &self,
        agent_id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        model: Option<&str>,
    ) -> Option<TriggeredThreshold> {
        let entries: Vec<(Uuid, Arc<Mutex<BudgetTracking>>)> = {
            let trackings = self.trackings.read().await;
            trackings
                .iter()
                .map(|(id, entry)| (*id, Arc::clone(entry)))
                .collect()
        };
        let mut budget_id = None;
        for (id, entry) in entries {
            let tracking = entry.lock().await;
            if tracking.agent_id == agent_id && tracking.is_active() {
                budget_id = Some(id);
                break;
            }
        }
        let budget_id = budget_id?;
        self.record_tokens(budget_id, prompt_tokens, completion_tokens, model)
            .await
    }

    /// Usage summary for one tracking.
    pub async fn usage(&self, budget_id: Uuid) -> Option<TrackingUsage> {
        let entry = self.tracking_entry(budget_id).await?;
        let tracking = entry.lock().await;
        Some(TrackingUsage {
            budget_id,
            tokens_used: tracking.tokens_used,
            cost_used: tracking.cost_used,
            percent_used: tracking.percent_used(),
            max_tokens: tracking.config.max_tokens,
            max_cost: tracking.config.max_cost,
        })
    }

    /// Snapshot of one tracking record.
    pub async fn tracking(&self, budget_id: Uuid) -> Option<BudgetTracking> {
        let entry = self.tracking_entry(budget_id).await?;
        let tracking = entry.lock().await;
        Some(tracking.clone())
    }

    /// Mark a run naturally completed. Unknown budgets warn and no-op.
    pub async fn complete_tracking(&self, budget_id: Uuid) {
        let Some(entry) = self.tracking_entry(budget_id).await else {
            tracing::warn!(%budget_id, "complete for unknown budget");
            return;
        };
        {
            let mut tracking = entry.lock().await;
            if tracking.completed_at.is_none() {
                tracking.completed_at = Some(Utc::now());
            }
        }
        self.ladder.forget_budget(budget_id);
    }

    /// Terminate a run by force, emitting the kill-request event the
    /// scheduler and session bridge observe.
    pub async fn kill_tracking(&self, budget_id: Uuid, reason: &str) {
        let Some(entry) = self.tracking_entry(budget_id).await else {
            tracing::warn!(%budget_id, "kill for unknown budget");
            return;
        };
        let agent_id = {
            let mut tracking = entry.lock().await;
            tracking.completed_at = Some(Utc::now());
            tracking.killed = true;
            tracking.kill_reason = Some(reason.to_string());
            tracking.agent_id.clone()
        };
        self.ladder.forget_budget(budget_id);
        self.bus.emit(
            EventSeverity::Critical,
            EventCategory::Budget,
            EventPayload::AgentKillRequested {
                agent_id,
                budget_id,
                reason: reason.to_string(),
            },
        );
    }

    // -------------------------------------------------------------------------
    // Aggregations
    // -------------------------------------------------------------------------

    /// Every tracking for one agent, newest last.
    pub async fn agent_status(&self, agent_id: &str) -> Vec<BudgetTracking> {
        let mut snapshots = self
            .snapshots(|tracking| tracking.agent_id == agent_id)
            .await;
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    /// Trackings, total cost, and configuration for one project.
    pub async fn project_status(&self, project_id: &str) -> ProjectStatus {
        let trackings = self
            .snapshots(|tracking| tracking.project_id == project_id)
            .await;
        let total_cost = trackings.iter().map(|t| t.cost_used.total).sum();
        let config = self
            .get_config(BudgetScopeKind::Project, project_id)
            .await;
        ProjectStatus {
            trackings,
            total_cost,
            config,
        }
    }

    /// Aggregate a project's usage by agent and by calendar day.
    pub async fn report(&self, project_id: &str, period: ReportPeriod) -> BudgetReport {
        let period_end = Utc::now();
        let period_start = period.window(period_end);
        let trackings = self
            .snapshots(|tracking| {
                tracking.project_id == project_id && tracking.started_at >= period_start
            })
            .await;

        let mut by_agent: HashMap<String, AgentReportRow> = HashMap::new();
        let mut by_day: BTreeMap<chrono::NaiveDate, f64> = BTreeMap::new();
        let mut total_cost = 0.0;
        let mut total_tokens = 0;
        for tracking in &trackings {
            let row = by_agent.entry(tracking.agent_id.clone()).or_default();
            row.tokens.add(
                tracking.tokens_used.prompt,
                tracking.tokens_used.completion,
            );
            row.cost += tracking.cost_used.total;
            row.runs += 1;
            *by_day.entry(tracking.started_at.date_naive()).or_insert(0.0) +=
                tracking.cost_used.total;
            total_cost += tracking.cost_used.total;
            total_tokens += tracking.tokens_used.total;
        }

        BudgetReport {
            project_id: project_id.to_string(),
            period_start,
            period_end,
            by_agent,
            by_day,
            total_cost,
            total_tokens,
        }
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Register a persisted alert for a project.
    pub async fn add_alert(&self, alert: BudgetAlert) -> Result<BudgetAlert, BudgetError> {
        alert.validate().map_err(BudgetError::Validation)?;
        self.alerts
            .write()
            .await
            .entry(alert.project_id.clone())
            .or_default()
            .push(alert.clone());
        self.persist().await;
        Ok(alert)
    }

    /// All alerts registered for a project.
    pub async fn list_alerts(&self, project_id: &str) -> Vec<BudgetAlert> {
        self.alerts
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove an alert by id. Returns false if no alert matched.
    pub async fn remove_alert(&self, alert_id: Uuid) -> bool {
        let removed = {
            let mut alerts = self.alerts.write().await;
            let mut removed = false;
            for entries in alerts.values_mut() {
                let before = entries.len();
                entries.retain(|alert| alert.id != alert_id);
                removed |= entries.len() != before;
            }
            alerts.retain(|_, entries| !entries.is_empty());
            removed
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    async fn tracking_entry(&self, budget_id: Uuid) -> Option<Arc<Mutex<BudgetTracking>>> {
        self.trackings.read().await.get(&budget_id).cloned()
    }

    async fn snapshots<F>(&self, keep: F) -> Vec<BudgetTracking>
    where
        F: Fn(&BudgetTracking) -> bool,
    {
        let entries: Vec<Arc<Mutex<BudgetTracking>>> = {
            let trackings = self.trackings.read().await;
            trackings.values().cloned().collect()
        };
        let mut snapshots = Vec::new();
        for entry in entries {
            let tracking = entry.lock().await;
            if keep(&tracking) {
                snapshots.push(tracking.clone());
            }
        }
        snapshots
    }

    fn default_config(&self, kind: BudgetScopeKind, scope: &str) -> BudgetConfig {
        BudgetConfig::new(
            kind,
            scope,
            self.config.default_max_tokens,
            self.config.default_max_cost,
        )
    }

    /// Most-specific configuration lookup: task → agent → swarm → project →
    /// engine default.
    async fn resolve_config(
        &self,
        task_id: &str,
        agent_id: &str,
        swarm_id: Option<&str>,
        project_id: &str,
    ) -> BudgetConfig {
        let configs = self.configs.read().await;
        let mut keys = vec![
            format!("{}:{task_id}", BudgetScopeKind::Task),
            format!("{}:{agent_id}", BudgetScopeKind::Agent),
        ];
        if let Some(swarm_id) = swarm_id {
            keys.push(format!("{}:{swarm_id}", BudgetScopeKind::Swarm));
        }
        keys.push(format!("{}:{project_id}", BudgetScopeKind::Project));
        for key in keys {
            if let Some(config) = configs.get(&key) {
                return config.clone();
            }
        }
        self.default_config(BudgetScopeKind::Project, project_id)
    }

    /// Execute a triggered threshold's action. Runs outside the tracking lock.
    async fn execute_action(&self, budget_id: Uuid, context: &TriggerContext) {
        let trigger = &context.trigger;
        let action_name = format!("threshold.{}", trigger.action);
        tracing::warn!(
            %budget_id,
            agent_id = %context.agent_id,
            percent = context.percent,
            action = %trigger.action,
            "budget threshold crossed"
        );
        self.audit
            .record(
                AuditLevel::Warning,
                AuditCategory::Budget,
                Some(context.agent_id.clone()),
                Some(budget_id),
                action_name,
                trigger.message.clone(),
            )
            .await;
        self.bus.emit(
            EventSeverity::Warning,
            EventCategory::Budget,
            EventPayload::ThresholdTriggered {
                budget_id,
                agent_id: context.agent_id.clone(),
                threshold_pct: trigger.threshold_pct,
                action: trigger.action,
                message: trigger.message.clone(),
            },
        );

        // notify and every stage above it dispatch notification channels.
        if trigger.action != crate::domain::models::ThresholdAction::Warn {
            let channels = self
                .notification_channels(&context.project_id, context.percent, &trigger.notify)
                .await;
            if !channels.is_empty() {
                self.bus.emit(
                    EventSeverity::Warning,
                    EventCategory::Budget,
                    EventPayload::NotificationRequested {
                        agent_id: context.agent_id.clone(),
                        channels,
                        message: trigger.message.clone(),
                    },
                );
            }
        }

        if trigger.should_block() {
            self.blocks
                .block(&context.agent_id, budget_id, trigger.threshold_pct);
            self.bus.emit(
                EventSeverity::Warning,
                EventCategory::Budget,
                EventPayload::AgentBlocked {
                    agent_id: context.agent_id.clone(),
                    budget_id,
                    threshold_pct: trigger.threshold_pct,
                },
            );
        }

        if trigger.should_kill() {
            if trigger.action == crate::domain::models::ThresholdAction::Audit {
                self.audit
                    .record(
                        AuditLevel::Critical,
                        AuditCategory::Compliance,
                        Some(context.agent_id.clone()),
                        Some(budget_id),
                        "compliance.overrun",
                        format!(
                            "usage reached {:.1}% of budget, flagged for compliance review",
                            context.percent
                        ),
                    )
                    .await;
            }
            self.blocks
                .block_killed(&context.agent_id, budget_id, trigger.threshold_pct);
            self.ladder.forget_budget(budget_id);
            self.bus.emit(
                EventSeverity::Critical,
                EventCategory::Budget,
                EventPayload::AgentKillRequested {
                    agent_id: context.agent_id.clone(),
                    budget_id,
                    reason: trigger.message.clone(),
                },
            );
        }
    }

    /// Channels to notify at `percent`: the rung's own channels plus any
    /// project alert whose threshold is at or below the current usage.
    async fn notification_channels(
        &self,
        project_id: &str,
        percent: f64,
        rung_channels: &[String],
    ) -> Vec<String> {
        let mut channels: Vec<String> = rung_channels.to_vec();
        for alert in self.list_alerts(project_id).await {
            if percent >= alert.threshold_pct {
                if let Some(url) = &alert.webhook_url {
                    channels.push(format!("webhook:{url}"));
                }
                if let Some(email) = &alert.email {
                    channels.push(format!("email:{email}"));
                }
                if let Some(sms) = &alert.sms {
                    channels.push(format!("sms:{sms}"));
                }
            }
        }
        channels.dedup();
        channels
    }

    /// Best-effort persistence; failures are logged, memory stays authoritative.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let configs = self.configs.read().await.clone();
        let alerts = self.alerts.read().await.clone();
        if let Err(error) = store.save(&configs, &alerts).await {
            tracing::error!(%error, "failed to persist budgets document");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ThresholdAction, ThresholdConfig};

    fn engine() -> BudgetEngine {
        BudgetEngine::new(
            BudgetEngineConfig::default(),
            Arc::new(CostCalculator::new()),
            Arc::new(ThresholdLadder::new()),
            Arc::new(BlockRegistry::new()),
            Arc::new(AuditLog::default()),
            Arc::new(EventBus::default()),
            None,
        )
    }

    #[tokio::test]
    async fn test_set_and_get_config_round_trip() {
        let engine = engine();
        let patch = BudgetConfigPatch {
            max_cost: Some(10.0),
            max_tokens: Some(1_000_000),
            ..BudgetConfigPatch::default()
        };
        let stored = engine
            .set_config(BudgetScopeKind::Project, "P", patch)
            .await
            .unwrap();
        let fetched = engine
            .get_config(BudgetScopeKind::Project, "P")
            .await
            .unwrap();
        assert_eq!(stored, fetched);
        assert_eq!(fetched.max_cost, 10.0);
    }

    #[tokio::test]
    async fn test_set_config_rejects_zero_max_cost() {
        let engine = engine();
        let patch = BudgetConfigPatch {
            max_cost: Some(0.0),
            ..BudgetConfigPatch::default()
        };
        let result = engine.set_config(BudgetScopeKind::Project, "P", patch).await;
        assert!(matches!(result, Err(BudgetError::Validation(_))));
    }

    #[tokio::test]
    async fn test_config_resolution_specificity() {
        let engine = engine();
        engine
            .set_config(
                BudgetScopeKind::Project,
                "P",
                BudgetConfigPatch {
                    max_cost: Some(100.0),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();
        engine
            .set_config(
                BudgetScopeKind::Agent,
                "a",
                BudgetConfigPatch {
                    max_cost: Some(5.0),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();

        let tracking = engine.begin_tracking("a", "t", "P", "sonnet", None).await;
        assert_eq!(tracking.config.max_cost, 5.0);
        assert_eq!(tracking.config.kind, BudgetScopeKind::Agent);

        let other = engine.begin_tracking("b", "t2", "P", "sonnet", None).await;
        assert_eq!(other.config.max_cost, 100.0);
    }

    #[tokio::test]
    async fn test_record_tokens_accumulates_and_conserves() {
        let engine = engine();
        let tracking = engine.begin_tracking("a", "t", "P", "sonnet", None).await;

        engine.record_tokens(tracking.id, 1000, 500, None).await;
        engine.record_tokens(tracking.id, 200, 100, None).await;

        let usage = engine.usage(tracking.id).await.unwrap();
        assert_eq!(usage.tokens_used.prompt, 1200);
        assert_eq!(usage.tokens_used.completion, 600);
        assert_eq!(
            usage.tokens_used.total,
            usage.tokens_used.prompt + usage.tokens_used.completion
        );
    }

    #[tokio::test]
    async fn test_ladder_blocks_at_ninety_percent() {
        let engine = engine();
        engine
            .set_config(
                BudgetScopeKind::Project,
                "P",
                BudgetConfigPatch {
                    max_cost: Some(10.0),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();
        let tracking = engine.begin_tracking("a", "t", "P", "default", None).await;

        // 1M prompt + 400K completion on the default row: $3 + $6 = $9 = 90%.
        let trigger = engine
            .record_tokens(tracking.id, 1_000_000, 400_000, None)
            .await
            .unwrap();
        assert_eq!(trigger.threshold_pct, 90.0);
        assert_eq!(trigger.action, ThresholdAction::Block);

        let blocks = engine.blocks();
        assert!(blocks.is_blocked("a"));
        assert_eq!(blocks.list().len(), 1);
    }

    #[tokio::test]
    async fn test_kill_terminates_tracking() {
        let engine = engine();
        engine
            .set_config(
                BudgetScopeKind::Project,
                "P",
                BudgetConfigPatch {
                    max_cost: Some(1.0),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();
        let tracking = engine.begin_tracking("a", "t", "P", "default", None).await;

        // $1.05 on a $1 budget → 105% → the 100/kill rung.
        let trigger = engine
            .record_tokens(tracking.id, 350_000, 0, None)
            .await
            .unwrap();
        assert_eq!(trigger.action, ThresholdAction::Kill);

        let snapshot = engine.tracking(tracking.id).await.unwrap();
        assert!(snapshot.killed);
        assert!(snapshot.completed_at.is_some());
        assert_eq!(snapshot.history.len(), 1);

        // Further records no-op on the finished run.
        assert!(engine.record_tokens(tracking.id, 100, 0, None).await.is_none());
    }

    #[tokio::test]
    async fn test_audit_action_appends_compliance_and_kills() {
        let engine = engine();
        engine
            .set_config(
                BudgetScopeKind::Project,
                "P",
                BudgetConfigPatch {
                    max_cost: Some(1.0),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();
        let tracking = engine.begin_tracking("a", "t", "P", "default", None).await;

        // $1.20 → 120% → the 110/audit rung.
        let trigger = engine
            .record_tokens(tracking.id, 400_000, 0, None)
            .await
            .unwrap();
        assert_eq!(trigger.action, ThresholdAction::Audit);
        assert!(trigger.should_kill());

        let compliance = engine
            .audit
            .query(&crate::services::audit_log::AuditFilter {
                category: Some(AuditCategory::Compliance),
                ..Default::default()
            })
            .await;
        assert_eq!(compliance.len(), 1);
        assert!(engine.tracking(tracking.id).await.unwrap().killed);
    }

    #[tokio::test]
    async fn test_unknown_budget_is_noop() {
        let engine = engine();
        assert!(engine.record_tokens(Uuid::new_v4(), 100, 100, None).await.is_none());
        assert!(engine.usage(Uuid::new_v4()).await.is_none());
        assert!(engine.tracking(Uuid::new_v4()).await.is_none());
        engine.complete_tracking(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn test_custom_ladder_cooldown_suppresses_repeat() {
        let engine = engine();
        engine
            .set_config(
                BudgetScopeKind::Project,
                "P",
                BudgetConfigPatch {
                    max_cost: Some(10.0),
                    ladder: Some(vec![
                        ThresholdConfig::new(50.0, ThresholdAction::Warn).with_cooldown(60)
                    ]),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();
        let tracking = engine.begin_tracking("a", "t", "P", "default", None).await;

        // $6 = 60% → warn fires.
        assert!(engine
            .record_tokens(tracking.id, 2_000_000, 0, None)
            .await
            .is_some());
        // Another delta inside the cooldown window stays quiet.
        assert!(engine
            .record_tokens(tracking.id, 100_000, 0, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_agent_and_project_status() {
        let engine = engine();
        let first = engine.begin_tracking("a", "t1", "P", "sonnet", None).await;
        let second = engine.begin_tracking("a", "t2", "P", "sonnet", None).await;
        engine.begin_tracking("b", "t3", "Q", "sonnet", None).await;

        engine.record_tokens(first.id, 1000, 0, None).await;
        engine.record_tokens(second.id, 1000, 0, None).await;

        let agent = engine.agent_status("a").await;
        assert_eq!(agent.len(), 2);

        let project = engine.project_status("P").await;
        assert_eq!(project.trackings.len(), 2);
        assert!(project.total_cost > 0.0);
        assert!(project.config.is_none());
    }

    #[tokio::test]
    async fn test_report_aggregates_by_agent_and_day() {
        let engine = engine();
        let first = engine.begin_tracking("a", "t1", "P", "default", None).await;
        let second = engine.begin_tracking("b", "t2", "P", "default", None).await;
        engine.record_tokens(first.id, 1_000_000, 0, None).await;
        engine.record_tokens(second.id, 2_000_000, 0, None).await;

        let report = engine.report("P", ReportPeriod::Week).await;
        assert_eq!(report.by_agent.len(), 2);
        assert_eq!(report.by_day.len(), 1);
        assert!((report.total_cost - 9.0).abs() < 1e-6);
        assert_eq!(report.by_agent.get("a").unwrap().runs, 1);
    }

    #[tokio::test]
    async fn test_alert_round_trip() {
        let engine = engine();
        let alert = BudgetAlert {
            id: Uuid::new_v4(),
            project_id: "P".to_string(),
            threshold_pct: 80.0,
            webhook_url: Some("https://example.com/hook".to_string()),
            email: None,
            sms: None,
        };
        engine.add_alert(alert.clone()).await.unwrap();
        assert_eq!(engine.list_alerts("P").await.len(), 1);
        assert!(engine.remove_alert(alert.id).await);
        assert!(engine.list_alerts("P").await.is_empty());
        assert!(!engine.remove_alert(alert.id).await);
    }

    #[tokio::test]
    async fn test_record_tokens_for_agent_routes_to_active_tracking() {
        let engine = engine();
        let tracking = engine.begin_tracking("a", "t", "P", "sonnet", None).await;
        engine.record_tokens_for_agent("a", 500, 250, None).await;
        let usage = engine.usage(tracking.id).await.unwrap();
        assert_eq!(usage.tokens_used.total, 750);
        assert!(engine
            .record_tokens_for_agent("ghost", 1, 1, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_persistence_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let make = || {
            BudgetEngine::new(
                BudgetEngineConfig::default(),
                Arc::new(CostCalculator::new()),
                Arc::new(ThresholdLadder::new()),
                Arc::new(BlockRegistry::new()),
                Arc::new(AuditLog::default()),
                Arc::new(EventBus::default()),
                Some(JsonBudgetStore::new(dir.path())),
            )
        };

        let engine = make();
        engine
            .set_config(
                BudgetScopeKind::Project,
                "P",
                BudgetConfigPatch {
                    max_cost: Some(42.0),
                    ..BudgetConfigPatch::default()
                },
            )
            .await
            .unwrap();

        let reloaded = make();
        reloaded.load().await;
        let config = reloaded
            .get_config(BudgetScopeKind::Project, "P")
            .await
            .unwrap();
        assert_eq!(config.max_cost, 42.0);
    }
}
