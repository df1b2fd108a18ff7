//! Budget configurations, live tracking records, alerts, and the threshold ladder model.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The subject kind a budget configuration applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetScopeKind {
    Task,
    Agent,
    Swarm,
    Project,
}

impl std::fmt::Display for BudgetScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Agent => write!(f, "agent"),
            Self::Swarm => write!(f, "swarm"),
            Self::Project => write!(f, "project"),
        }
    }
}

impl std::str::FromStr for BudgetScopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "agent" => Ok(Self::Agent),
            "swarm" => Ok(Self::Swarm),
            "project" => Ok(Self::Project),
            other => Err(format!("unknown budget scope kind: {other}")),
        }
    }
}

/// Reset period of a budget, with its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "period", rename_all = "lowercase")]
pub enum BudgetPeriod {
    /// Resets every day at `reset_hour` (0–23, UTC).
    Daily { reset_hour: u8 },
    /// Resets every week at midnight UTC of `reset_day` (0–6, Sunday = 0).
    Weekly { reset_day: u8 },
    /// Resets every month at midnight UTC of day `reset_day` (1–28).
    Monthly { reset_day: u8 },
}

impl BudgetPeriod {
    /// Reject out-of-range reset anchors.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Daily { reset_hour } if *reset_hour > 23 => {
                Err(format!("daily reset hour must be 0-23, got {reset_hour}"))
            }
            Self::Weekly { reset_day } if *reset_day > 6 => {
                Err(format!("weekly reset day must be 0-6, got {reset_day}"))
            }
            Self::Monthly { reset_day } if !(1..=28).contains(reset_day) => {
                Err(format!("monthly reset day must be 1-28, got {reset_day}"))
            }
            _ => Ok(()),
        }
    }

    /// Start of the usage window containing `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Daily { reset_hour } => {
                let time = NaiveTime::from_hms_opt(u32::from(*reset_hour), 0, 0)
                    .unwrap_or(NaiveTime::MIN);
                let candidate =
                    Utc.from_utc_datetime(&NaiveDateTime::new(now.date_naive(), time));
                if candidate <= now {
                    candidate
                } else {
                    candidate - Duration::days(1)
                }
            }
            Self::Weekly { reset_day } => {
                let days_back = (i64::from(now.weekday().num_days_from_sunday())
                    - i64::from(*reset_day))
                .rem_euclid(7);
                let date = now.date_naive() - Duration::days(days_back);
                Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::MIN))
            }
            Self::Monthly { reset_day } => {
                let today = now.date_naive();
                let day = u32::from(*reset_day);
                let date = if today.day() >= day {
                    today.with_day(day).unwrap_or(today)
                } else {
                    let (year, month) = if today.month() == 1 {
                        (today.year() - 1, 12)
                    } else {
                        (today.year(), today.month() - 1)
                    };
                    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(today)
                };
                Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::MIN))
            }
        }
    }
}

/// The staged action a crossed threshold demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdAction {
    /// Emit a warning record only.
    Warn,
    /// Warn plus dispatch notifications.
    Notify,
    /// Notify plus block the agent pending approval.
    Block,
    /// Notify plus terminate the agent run.
    Kill,
    /// Append a compliance record and perform the kill action.
    Audit,
}

impl ThresholdAction {
    /// True iff this action blocks the agent pending approval.
    pub const fn should_block(self) -> bool {
        matches!(self, Self::Block)
    }

    /// True iff this action terminates the agent run. `Audit` implies kill.
    pub const fn should_kill(self) -> bool {
        matches!(self, Self::Kill | Self::Audit)
    }
}

impl std::fmt::Display for ThresholdAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warn => write!(f, "warn"),
            Self::Notify => write!(f, "notify"),
            Self::Block => write!(f, "block"),
            Self::Kill => write!(f, "kill"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// One rung of a threshold ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Percentage of budget at which this rung fires (e.g. `90.0`).
    pub threshold_pct: f64,
    pub action: ThresholdAction,
    /// Notification channels in `kind:target` form (`webhook|email|sms`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
    /// Minimum seconds between fires of this rung for one budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ThresholdConfig {
    pub fn new(threshold_pct: f64, action: ThresholdAction) -> Self {
        Self {
            threshold_pct,
            action,
            notify: Vec::new(),
            cooldown_secs: None,
            message: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown_secs: u64) -> Self {
        self.cooldown_secs = Some(cooldown_secs);
        self
    }
}

/// The fixed default ladder: 50/warn, 75/notify, 90/block, 100/kill, 110/audit.
pub fn default_ladder() -> Vec<ThresholdConfig> {
    vec![
        ThresholdConfig::new(50.0, ThresholdAction::Warn),
        ThresholdConfig::new(75.0, ThresholdAction::Notify),
        ThresholdConfig::new(90.0, ThresholdAction::Block),
        ThresholdConfig::new(100.0, ThresholdAction::Kill),
        ThresholdConfig::new(110.0, ThresholdAction::Audit),
    ]
}

/// A parsed notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "target")]
pub enum NotificationChannel {
    Webhook(String),
    Email(String),
    Sms(String),
}

impl NotificationChannel {
    /// Parse a `kind:target` channel string.
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, target) = raw.split_once(':')?;
        if target.is_empty() {
            return None;
        }
        match kind {
            "webhook" => Some(Self::Webhook(target.to_string())),
            "email" => Some(Self::Email(target.to_string())),
            "sms" => Some(Self::Sms(target.to_string())),
            _ => None,
        }
    }
}

/// A budget configuration addressed by `(kind, scope)`. Persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub kind: BudgetScopeKind,
    /// The subject this configuration governs (task id, agent id, swarm id, or project id).
    pub scope: String,
    pub max_tokens: u64,
    pub max_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<BudgetPeriod>,
    /// Threshold ladder; defaults to [`default_ladder`].
    #[serde(default = "default_ladder")]
    pub ladder: Vec<ThresholdConfig>,
}

impl BudgetConfig {
    pub fn new(kind: BudgetScopeKind, scope: impl Into<String>, max_tokens: u64, max_cost: f64) -> Self {
        Self {
            kind,
            scope: scope.into(),
            max_tokens,
            max_cost,
            period: None,
            ladder: default_ladder(),
        }
    }

    /// The persistence key, `<kind>:<scope>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.scope)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scope.is_empty() {
            return Err("budget scope cannot be empty".to_string());
        }
        if self.max_cost <= 0.0 || !self.max_cost.is_finite() {
            return Err(format!("max cost must be positive, got {}", self.max_cost));
        }
        if self.max_tokens == 0 {
            return Err("max tokens must be positive".to_string());
        }
        if let Some(period) = &self.period {
            period.validate()?;
        }
        for rung in &self.ladder {
            if !rung.threshold_pct.is_finite() || rung.threshold_pct < 0.0 {
                return Err(format!(
                    "threshold percentage must be non-negative, got {}",
                    rung.threshold_pct
                ));
            }
        }
        Ok(())
    }
}

/// Partial override applied on top of a resolved configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<BudgetPeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ladder: Option<Vec<ThresholdConfig>>,
}

impl BudgetConfigPatch {
    /// Overlay the set fields onto `config`.
    pub fn apply_to(&self, config: &mut BudgetConfig) {
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(max_cost) = self.max_cost {
            config.max_cost = max_cost;
        }
        if let Some(period) = self.period {
            config.period = Some(period);
        }
        if let Some(ladder) = &self.ladder {
            config.ladder = ladder.clone();
        }
    }
}

/// Cumulative token counts. Invariant: `total == prompt + completion`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    /// Add a delta, maintaining the total invariant.
    pub fn add(&mut self, prompt: u64, completion: u64) {
        self.prompt += prompt;
        self.completion += completion;
        self.total = self.prompt + self.completion;
    }
}

/// Cumulative cost in currency units, same shape as [`TokenUsage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostUsage {
    pub prompt: f64,
    pub completion: f64,
    pub total: f64,
}

impl CostUsage {
    pub fn add(&mut self, prompt: f64, completion: f64) {
        self.prompt += prompt;
        self.completion += completion;
        self.total = self.prompt + self.completion;
    }
}

/// One threshold fire recorded in a tracking's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdEvent {
    pub timestamp: DateTime<Utc>,
    pub threshold_pct: f64,
    pub action: ThresholdAction,
    pub message: String,
}

/// Live accounting record for one agent run. Not persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetTracking {
    pub id: Uuid,
    pub agent_id: String,
    pub task_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<String>,
    pub model: String,
    pub tokens_used: TokenUsage,
    pub cost_used: CostUsage,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The configuration resolved at `begin_tracking` time.
    pub config: BudgetConfig,
    pub history: Vec<ThresholdEvent>,
    /// Set when the run was terminated by a kill action rather than completion.
    #[serde(default)]
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
}

impl BudgetTracking {
    /// Percent of the cost budget consumed.
    pub fn percent_used(&self) -> f64 {
        if self.config.max_cost > 0.0 {
            self.cost_used.total / self.config.max_cost * 100.0
        } else {
            0.0
        }
    }

    /// True while the run is neither completed nor killed.
    pub fn is_active(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// A persisted notification alert attached to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub id: Uuid,
    pub project_id: String,
    pub threshold_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<String>,
}

impl BudgetAlert {
    pub fn validate(&self) -> Result<(), String> {
        if self.webhook_url.is_none() && self.email.is_none() && self.sms.is_none() {
            return Err("alert must name at least one of webhook, email, sms".to_string());
        }
        if !(0.0..=1000.0).contains(&self.threshold_pct) {
            return Err(format!(
                "alert threshold must be 0-1000 percent, got {}",
                self.threshold_pct
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_invariant() {
        let mut usage = TokenUsage::default();
        usage.add(100, 50);
        usage.add(10, 5);
        assert_eq!(usage.total, usage.prompt + usage.completion);
        assert_eq!(usage.total, 165);
    }

    #[test]
    fn test_default_ladder_shape() {
        let ladder = default_ladder();
        assert_eq!(ladder.len(), 5);
        assert_eq!(ladder[0].threshold_pct, 50.0);
        assert_eq!(ladder[0].action, ThresholdAction::Warn);
        assert_eq!(ladder[4].threshold_pct, 110.0);
        assert_eq!(ladder[4].action, ThresholdAction::Audit);
    }

    #[test]
    fn test_audit_implies_kill() {
        assert!(ThresholdAction::Audit.should_kill());
        assert!(ThresholdAction::Kill.should_kill());
        assert!(!ThresholdAction::Block.should_kill());
        assert!(ThresholdAction::Block.should_block());
    }

    #[test]
    fn test_notification_channel_parse() {
        assert_eq!(
            NotificationChannel::parse("webhook:https://example.com/hook"),
            Some(NotificationChannel::Webhook(
                "https://example.com/hook".to_string()
            ))
        );
        assert_eq!(
            NotificationChannel::parse("email:ops@example.com"),
            Some(NotificationChannel::Email("ops@example.com".to_string()))
        );
        assert!(NotificationChannel::parse("pager:123").is_none());
        assert!(NotificationChannel::parse("email:").is_none());
        assert!(NotificationChannel::parse("plain").is_none());
    }

    #[test]
    fn test_config_key_format() {
        let config = BudgetConfig::new(BudgetScopeKind::Project, "acme", 1_000_000, 50.0);
        assert_eq!(config.key(), "project:acme");
    }

    #[test]
    fn test_config_validation_rejects_zero_max_cost() {
        let config = BudgetConfig::new(BudgetScopeKind::Project, "acme", 1_000_000, 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_patch_overlay() {
        let mut config = BudgetConfig::new(BudgetScopeKind::Project, "acme", 1_000_000, 50.0);
        let patch = BudgetConfigPatch {
            max_cost: Some(10.0),
            ..BudgetConfigPatch::default()
        };
        patch.apply_to(&mut config);
        assert_eq!(config.max_cost, 10.0);
        assert_eq!(config.max_tokens, 1_000_000);
    }

    #[test]
    fn test_daily_window_start() {
        let period = BudgetPeriod::Daily { reset_hour: 6 };
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            period.window_start(now),
            Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap()
        );
        let early = Utc.with_ymd_and_hms(2026, 3, 10, 5, 0, 0).unwrap();
        assert_eq!(
            period.window_start(early),
            Utc.with_ymd_and_hms(2026, 3, 9, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_weekly_window_start() {
        // 2026-03-10 is a Tuesday; reset day 0 (Sunday) → 2026-03-08.
        let period = BudgetPeriod::Weekly { reset_day: 0 };
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            period.window_start(now),
            Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_monthly_window_start_wraps_year() {
        let period = BudgetPeriod::Monthly { reset_day: 15 };
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(
            period.window_start(now),
            Utc.with_ymd_and_hms(2025, 12, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_period_validation() {
        assert!(BudgetPeriod::Daily { reset_hour: 24 }.validate().is_err());
        assert!(BudgetPeriod::Weekly { reset_day: 7 }.validate().is_err());
        assert!(BudgetPeriod::Monthly { reset_day: 29 }.validate().is_err());
        assert!(BudgetPeriod::Monthly { reset_day: 28 }.validate().is_ok());
    }

    #[test]
    fn test_percent_used() {
        let mut tracking = BudgetTracking {
            id: Uuid::new_v4(),
            agent_id: "a".into(),
            task_id: "t".into(),
            project_id: "p".into(),
            swarm_id: None,
            model: "default".into(),
            tokens_used: TokenUsage::default(),
            cost_used: CostUsage::default(),
            started_at: Utc::now(),
            last_updated: Utc::now(),
            completed_at: None,
            config: BudgetConfig::new(BudgetScopeKind::Project, "p", 1_000_000, 10.0),
            history: Vec::new(),
            killed: false,
            kill_reason: None,
        };
        tracking.cost_used.add(3.0, 6.0);
        assert!((tracking.percent_used() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_alert_requires_channel() {
        let alert = BudgetAlert {
            id: Uuid::new_v4(),
            project_id: "p".into(),
            threshold_pct: 80.0,
            webhook_url: None,
            email: None,
            sms: None,
        };
        assert!(alert.validate().is_err());
    }
}
