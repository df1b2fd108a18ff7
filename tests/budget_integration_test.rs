//! End-to-end budget ladder scenarios: accounting, blocking, approval,
//! cooldowns, and persistence round trips.

mod common;

use common::control_plane;
use hivemind::domain::models::{
    BudgetAlert, BudgetConfigPatch, BudgetScopeKind, ThresholdAction, ThresholdConfig,
};
use hivemind::infrastructure::persistence::JsonBudgetStore;
use hivemind::services::session_bridge::LoopbackGateway;
use hivemind::{ControlPlane, ControlPlaneConfig};
use std::sync::Arc;
use uuid::Uuid;

async fn project_budget(plane: &ControlPlane, project: &str, max_cost: f64) {
    plane
        .engine
        .set_config(
            BudgetScopeKind::Project,
            project,
            BudgetConfigPatch {
                max_cost: Some(max_cost),
                ..BudgetConfigPatch::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn ladder_blocks_at_ninety_percent_and_approval_lifts() {
    let plane = control_plane();
    project_budget(&plane, "P", 10.0).await;

    let tracking = plane
        .engine
        .begin_tracking("a", "t", "P", "default", None)
        .await;

    // 1M prompt + 400K completion at $0.003/1k and $0.015/1k → $3 + $6 = $9.
    let trigger = plane
        .engine
        .record_tokens(tracking.id, 1_000_000, 400_000, None)
        .await
        .unwrap();
    assert_eq!(trigger.threshold_pct, 90.0);
    assert_eq!(trigger.action, ThresholdAction::Block);

    assert!(plane.blocks.is_blocked("a"));
    let listed = plane.blocks.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].agent_id, "a");

    // Approval for 30 minutes lifts the block.
    assert!(plane.blocks.approve("a", "alice", 30));
    assert!(!plane.blocks.is_blocked("a"));

    // An approval that has already run out re-opens the block without a new fire.
    plane.blocks.approve("a", "alice", 0);
    assert!(plane.blocks.is_blocked("a"));
}

#[tokio::test]
async fn kill_threshold_terminates_the_run() {
    let plane = control_plane();
    project_budget(&plane, "P", 10.0).await;

    let tracking = plane
        .engine
        .begin_tracking("a", "t", "P", "default", None)
        .await;

    // $10.50 of $10 → 105% → kill rung.
    let trigger = plane
        .engine
        .record_tokens(tracking.id, 3_500_000, 0, None)
        .await
        .unwrap();
    assert_eq!(trigger.action, ThresholdAction::Kill);

    let snapshot = plane.engine.tracking(tracking.id).await.unwrap();
    assert!(snapshot.killed);
    assert!(!snapshot.is_active());
    assert_eq!(snapshot.history.len(), 1);
    assert_eq!(snapshot.tokens_used.total, 3_500_000);
}

#[tokio::test]
async fn cooldown_suppresses_immediate_refire() {
    let plane = control_plane();
    plane
        .engine
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

    let tracking = plane
        .engine
        .begin_tracking("a", "t", "P", "default", None)
        .await;

    // First crossing fires.
    assert!(plane
        .engine
        .record_tokens(tracking.id, 2_000_000, 0, None)
        .await
        .is_some());
    // Still inside the 60s cooldown: quiet.
    assert!(plane
        .engine
        .record_tokens(tracking.id, 100_000, 0, None)
        .await
        .is_none());
}

#[tokio::test]
async fn token_totals_are_conserved_across_records() {
    let plane = control_plane();
    let tracking = plane
        .engine
        .begin_tracking("a", "t", "P", "sonnet", None)
        .await;

    for _ in 0..5 {
        plane.engine.record_tokens(tracking.id, 123, 77, None).await;
    }
    let usage = plane.engine.usage(tracking.id).await.unwrap();
    assert_eq!(usage.tokens_used.prompt, 615);
    assert_eq!(usage.tokens_used.completion, 385);
    assert_eq!(
        usage.tokens_used.total,
        usage.tokens_used.prompt + usage.tokens_used.completion
    );
}

#[tokio::test]
async fn config_round_trip_and_specificity() {
    let plane = control_plane();
    project_budget(&plane, "P", 100.0).await;

    let fetched = plane
        .engine
        .get_config(BudgetScopeKind::Project, "P")
        .await
        .unwrap();
    assert_eq!(fetched.max_cost, 100.0);
    assert_eq!(fetched.key(), "project:P");

    // A task-scoped config beats the project one for its task.
    plane
        .engine
        .set_config(
            BudgetScopeKind::Task,
            "t1",
            BudgetConfigPatch {
                max_cost: Some(1.0),
                ..BudgetConfigPatch::default()
            },
        )
        .await
        .unwrap();
    let tracking = plane
        .engine
        .begin_tracking("a", "t1", "P", "default", None)
        .await;
    assert_eq!(tracking.config.max_cost, 1.0);
}

#[tokio::test]
async fn alert_add_remove_round_trip() {
    let plane = control_plane();
    let alert = BudgetAlert {
        id: Uuid::new_v4(),
        project_id: "P".to_string(),
        threshold_pct: 80.0,
        webhook_url: Some("https://example.com/hook".to_string()),
        email: Some("ops@example.com".to_string()),
        sms: None,
    };

    let before = plane.engine.list_alerts("P").await;
    plane.engine.add_alert(alert.clone()).await.unwrap();
    assert_eq!(plane.engine.list_alerts("P").await.len(), 1);
    assert!(plane.engine.remove_alert(alert.id).await);
    assert_eq!(plane.engine.list_alerts("P").await, before);
}

#[tokio::test]
async fn configs_and_alerts_persist_across_engine_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let build = || {
        Arc::new(ControlPlane::new(
            ControlPlaneConfig::default(),
            Arc::new(LoopbackGateway::new()),
            Some(JsonBudgetStore::new(dir.path())),
        ))
    };

    {
        let plane = build();
        project_budget(&plane, "P", 33.0).await;
        plane
            .engine
            .add_alert(BudgetAlert {
                id: Uuid::new_v4(),
                project_id: "P".to_string(),
                threshold_pct: 75.0,
                webhook_url: None,
                email: Some("ops@example.com".to_string()),
                sms: None,
            })
            .await
            .unwrap();
        // Live tracking must NOT persist.
        plane
            .engine
            .begin_tracking("a", "t", "P", "default", None)
            .await;
    }

    let plane = build();
    plane.engine.load().await;
    let config = plane
        .engine
        .get_config(BudgetScopeKind::Project, "P")
        .await
        .unwrap();
    assert_eq!(config.max_cost, 33.0);
    assert_eq!(plane.engine.list_alerts("P").await.len(), 1);
    assert!(plane.engine.agent_status("a").await.is_empty());
}

#[tokio::test]
async fn project_status_and_report_aggregate_costs() {
    let plane = control_plane();
    project_budget(&plane, "P", 100.0).await;

    let first = plane
        .engine
        .begin_tracking("a", "t1", "P", "default", None)
        .await;
    let second = plane
        .engine
        .begin_tracking("b", "t2", "P", "default", None)
        .await;
    plane.engine.record_tokens(first.id, 1_000_000, 0, None).await;
    plane
        .engine
        .record_tokens(second.id, 0, 400_000, None)
        .await;

    let status = plane.engine.project_status("P").await;
    assert_eq!(status.trackings.len(), 2);
    assert!((status.total_cost - 9.0).abs() < 1e-6);
    assert!(status.config.is_some());

    let report = plane
        .engine
        .report("P", hivemind::services::ReportPeriod::Week)
        .await;
    assert_eq!(report.by_agent.len(), 2);
    assert!((report.total_cost - 9.0).abs() < 1e-6);
    assert_eq!(report.total_tokens, 1_400_000);
    assert_eq!(report.by_day.len(), 1);
}
