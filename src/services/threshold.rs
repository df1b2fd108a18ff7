//! Threshold ladder evaluation with per-budget cooldowns.
//!
//! `check` is pure: given a used-percentage and a ladder it returns the single
//! highest crossed rung. `check_with_cooldown` additionally consults a
//! per-budget map of last fire times and suppresses rungs inside their
//! configured cooldown.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::{ThresholdAction, ThresholdConfig};

/// The single highest rung crossed by a usage percentage.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredThreshold {
    pub threshold_pct: f64,
    pub action: ThresholdAction,
    pub message: String,
    /// Notification channels configured on the rung (`kind:target`).
    pub notify: Vec<String>,
}

impl TriggeredThreshold {
    /// True iff the action blocks the agent pending approval.
    pub fn should_block(&self) -> bool {
        self.action.should_block()
    }

    /// True iff the action terminates the agent run.
    pub fn should_kill(&self) -> bool {
        self.action.should_kill()
    }
}

fn threshold_key(pct: f64) -> i64 {
    // Basis points; ladder percentages compare exactly after this scaling.
    (pct * 100.0).round() as i64
}

/// Stateless ladder check plus the stateful cooldown table.
pub struct ThresholdLadder {
    /// `(budget, threshold) → last fire time`.
    cooldowns: Mutex<HashMap<(Uuid, i64), DateTime<Utc>>>,
}

impl ThresholdLadder {
    pub fn new() -> Self {
        Self {
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Return the highest rung with `percent >= threshold`, or `None`.
    ///
    /// An empty ladder yields `None`. Duplicate percentages are not expected;
    /// if present, the later entry wins.
    pub fn check(percent: f64, ladder: &[ThresholdConfig]) -> Option<TriggeredThreshold> {
        ladder
            .iter()
            .filter(|rung| percent >= rung.threshold_pct)
            .max_by(|a, b| {
                a.threshold_pct
                    .partial_cmp(&b.threshold_pct)
                    .unwrap_or(std::cmp::Ordering::Less)
            })
            .map(|rung| TriggeredThreshold {
                threshold_pct: rung.threshold_pct,
                action: rung.action,
                message: rung.message.clone().unwrap_or_else(|| {
                    format!(
                        "budget usage at {percent:.1}% crossed the {:.0}% {} threshold",
                        rung.threshold_pct, rung.action
                    )
                }),
                notify: rung.notify.clone(),
            })
    }

    /// As [`check`](Self::check), suppressed while the rung's cooldown for
    /// this budget is still running. A returned trigger records its fire time.
    pub fn check_with_cooldown(
        &self,
        budget_id: Uuid,
        percent: f64,
        ladder: &[ThresholdConfig],
    ) -> Option<TriggeredThreshold> {
        let triggered = Self::check(percent, ladder)?;
        let cooldown_secs = ladder
            .iter()
            .find(|rung| threshold_key(rung.threshold_pct) == threshold_key(triggered.threshold_pct))
            .and_then(|rung| rung.cooldown_secs);

        let key = (budget_id, threshold_key(triggered.threshold_pct));
        let now = Utc::now();
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let (Some(cooldown), Some(last)) = (cooldown_secs, cooldowns.get(&key)) {
            if (now - *last).num_seconds() < cooldown as i64 {
                return None;
            }
        }
        cooldowns.insert(key, now);
        Some(triggered)
    }

    /// Drop cooldown entries for a finished budget tracking.
    pub fn forget_budget(&self, budget_id: Uuid) {
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldowns.retain(|(id, _), _| *id != budget_id);
    }

    /// Drop entries older than `max_age_secs`. Idempotent; run periodically.
    pub fn prune_stale(&self, max_age_secs: u64) {
        let cutoff = Utc::now();
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldowns.retain(|_, fired_at| (cutoff - *fired_at).num_seconds() <= max_age_secs as i64);
    }
}

impl Default for ThresholdLadder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::default_ladder;
    use chrono::Duration;

    #[test]
    fn test_check_boundaries() {
        let ladder = default_ladder();
        assert!(ThresholdLadder::check(49.999, &ladder).is_none());

        let at_fifty = ThresholdLadder::check(50.0, &ladder).unwrap();
        assert_eq!(at_fifty.threshold_pct, 50.0);
        assert_eq!(at_fifty.action, ThresholdAction::Warn);

        let at_hundred = ThresholdLadder::check(100.0, &ladder).unwrap();
        assert_eq!(at_hundred.action, ThresholdAction::Kill);

        let at_audit = ThresholdLadder::check(110.0, &ladder).unwrap();
        assert_eq!(at_audit.action, ThresholdAction::Audit);
        assert!(at_audit.should_kill());
    }

    #[test]
    fn test_check_returns_highest_crossed() {
        let ladder = default_ladder();
        let triggered = ThresholdLadder::check(97.0, &ladder).unwrap();
        assert_eq!(triggered.threshold_pct, 90.0);
        assert!(triggered.should_block());
    }

    #[test]
    fn test_check_empty_ladder() {
        assert!(ThresholdLadder::check(500.0, &[]).is_none());
    }

    #[test]
    fn test_check_is_monotonic() {
        let ladder = default_ladder();
        let mut last = -1.0;
        for percent in [0.0, 49.0, 50.0, 74.9, 75.0, 89.0, 95.0, 100.0, 109.0, 120.0] {
            let pct = ThresholdLadder::check(percent, &ladder)
                .map_or(-1.0, |t| t.threshold_pct);
            assert!(pct >= last, "threshold regressed at {percent}%");
            last = pct;
        }
    }

    #[test]
    fn test_cooldown_suppresses_refire() {
        let service = ThresholdLadder::new();
        let budget_id = Uuid::new_v4();
        let ladder = vec![ThresholdConfig::new(50.0, ThresholdAction::Warn).with_cooldown(60)];

        assert!(service
            .check_with_cooldown(budget_id, 50.0, &ladder)
            .is_some());
        // Immediately after, still inside the 60s cooldown.
        assert!(service
            .check_with_cooldown(budget_id, 51.0, &ladder)
            .is_none());
    }

    #[test]
    fn test_cooldown_expires() {
        let service = ThresholdLadder::new();
        let budget_id = Uuid::new_v4();
        let ladder = vec![ThresholdConfig::new(50.0, ThresholdAction::Warn).with_cooldown(60)];

        assert!(service
            .check_with_cooldown(budget_id, 50.0, &ladder)
            .is_some());

        // Backdate the recorded fire past the cooldown.
        {
            let mut cooldowns = service.cooldowns.lock().unwrap();
            for fired_at in cooldowns.values_mut() {
                *fired_at = Utc::now() - Duration::seconds(61);
            }
        }
        assert!(service
            .check_with_cooldown(budget_id, 52.0, &ladder)
            .is_some());
    }

    #[test]
    fn test_cooldowns_are_per_budget() {
        let service = ThresholdLadder::new();
        let ladder = vec![ThresholdConfig::new(50.0, ThresholdAction::Warn).with_cooldown(60)];

        assert!(service
            .check_with_cooldown(Uuid::new_v4(), 50.0, &ladder)
            .is_some());
        assert!(service
            .check_with_cooldown(Uuid::new_v4(), 50.0, &ladder)
            .is_some());
    }

    #[test]
    fn test_no_cooldown_always_fires() {
        let service = ThresholdLadder::new();
        let budget_id = Uuid::new_v4();
        let ladder = default_ladder();
        assert!(service
            .check_with_cooldown(budget_id, 55.0, &ladder)
            .is_some());
        assert!(service
            .check_with_cooldown(budget_id, 56.0, &ladder)
            .is_some());
    }

    #[test]
    fn test_forget_budget_clears_entries() {
        let service = ThresholdLadder::new();
        let budget_id = Uuid::new_v4();
        let ladder = vec![ThresholdConfig::new(50.0, ThresholdAction::Warn).with_cooldown(60)];
        service.check_with_cooldown(budget_id, 50.0, &ladder);
        service.forget_budget(budget_id);
        assert!(service
            .check_with_cooldown(budget_id, 50.0, &ladder)
            .is_some());
    }
}
