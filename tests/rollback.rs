//! History and rollback through the write path.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use control_plane::audit::AuditAction;
use control_plane::model::{ChangeKind, ChangeRecord, FeatureFlag, FlagPatch, HistoryKey};
use control_plane::store::{ConfigStore, Mutation};
use control_plane::ControlPlaneError;

mod common;

use common::{ctx, Fixture};

#[tokio::test]
async fn test_rollback_restores_previous_value() {
    let f = Fixture::new();
    f.seed_checkout().await;
    f.set("checkout.maxRetries", "production", json!(4)).await;
    f.set("checkout.maxRetries", "production", json!(9)).await;
    let target = HistoryKey::configuration("checkout.maxRetries", "production");

    let outcome = f.plane.rollback.rollback(&target, 1, &ctx(), false).await.unwrap();
    assert!(outcome.plan.feasible);
    assert_eq!(outcome.plan.current_value, Some(json!(9)));
    assert_eq!(outcome.plan.projected_value, Some(json!(4)));
    assert!(outcome.applied.is_some());
    assert_eq!(f.number("checkout.maxRetries", "production").await, 4.0);

    let history = f
        .plane
        .rollback
        .config_history("checkout.maxRetries", "production", 1)
        .await
        .unwrap();
    assert!(matches!(history[0].kind, ChangeKind::Rollback { steps: 1, .. }));
    assert_eq!(f.audit.count(AuditAction::Rollback), 1);
}

#[tokio::test]
async fn test_rolling_back_a_rollback_restores_the_original() {
    let f = Fixture::new();
    f.seed_checkout().await;
    f.set("checkout.maxRetries", "production", json!(4)).await;
    f.set("checkout.maxRetries", "production", json!(9)).await;
    let target = HistoryKey::configuration("checkout.maxRetries", "production");
    let ledger_before = f.plane.service.history(&target, 50).await.unwrap();

    f.plane.rollback.rollback(&target, 1, &ctx(), false).await.unwrap();
    f.plane.rollback.rollback(&target, 1, &ctx(), false).await.unwrap();
    assert_eq!(f.number("checkout.maxRetries", "production").await, 9.0);

    // Both rollbacks are new forward records; older records are untouched.
    let ledger_after = f.plane.service.history(&target, 50).await.unwrap();
    assert_eq!(ledger_after.len(), ledger_before.len() + 2);
    assert_eq!(&ledger_after[2..], &ledger_before[..]);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let f = Fixture::new();
    f.seed_checkout().await;
    f.set("checkout.maxRetries", "production", json!(4)).await;
    let target = HistoryKey::configuration("checkout.maxRetries", "production");
    let version = f.plane.service.get_entry("checkout.maxRetries").await.unwrap().entry.version;

    let outcome = f.plane.rollback.rollback(&target, 1, &ctx(), true).await.unwrap();
    assert!(outcome.plan.feasible);
    assert!(outcome.applied.is_none());
    assert_eq!(outcome.plan.expected_version, version);
    assert_eq!(f.number("checkout.maxRetries", "production").await, 4.0);
    assert_eq!(f.audit.count(AuditAction::Rollback), 0);
}

#[tokio::test]
async fn test_rollback_past_override_creation_clears_it() {
    let f = Fixture::new();
    f.seed_checkout().await;
    let target = HistoryKey::configuration("checkout.maxRetries", "staging");

    let outcome = f.plane.rollback.rollback(&target, 1, &ctx(), false).await.unwrap();
    assert_eq!(outcome.plan.projected_value, None);
    assert_eq!(f.number("checkout.maxRetries", "staging").await, 3.0);
}

#[tokio::test]
async fn test_rollback_deeper_than_history_is_invalid() {
    let f = Fixture::new();
    f.seed_checkout().await;
    let target = HistoryKey::configuration("checkout.maxRetries", "production");

    let err = f.plane.rollback.rollback(&target, 5, &ctx(), false).await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_flag_definition_rollback() {
    let f = Fixture::new();
    f.plane
        .service
        .create_flag(FeatureFlag::new("newCheckoutFlow").enabled().with_rollout(10), &ctx())
        .await
        .unwrap();
    let patch = FlagPatch {
        rollout_percentage: Some(90),
        ..FlagPatch::default()
    };
    f.plane
        .service
        .update_flag("newCheckoutFlow", &patch, &ctx())
        .await
        .unwrap();

    let target = HistoryKey::flag("newCheckoutFlow");
    f.plane.rollback.rollback(&target, 1, &ctx(), false).await.unwrap();
    let flag = f.plane.service.get_flag("newCheckoutFlow").await.unwrap();
    assert_eq!(flag.rollout_percentage, 10);

    // Before creation there is nothing to restore.
    let history = f.plane.rollback.flag_history("newCheckoutFlow", 10).await.unwrap();
    let plan = f
        .plane
        .rollback
        .rollback(&target, history.len(), &ctx(), true)
        .await
        .unwrap()
        .plan;
    assert!(!plan.feasible);
}

#[tokio::test]
async fn test_flag_rollback_to_invalid_definition_is_infeasible() {
    let f = Fixture::new();
    f.plane
        .service
        .create_flag(FeatureFlag::new("newCheckoutFlow").enabled().with_rollout(10), &ctx())
        .await
        .unwrap();
    let target = HistoryKey::flag("newCheckoutFlow");
    let mut recorded = FeatureFlag::new("newCheckoutFlow").enabled().definition_json();
    recorded["rollout_percentage"] = json!(150);
    f.store
        .commit(vec![Mutation::AppendHistory(ChangeRecord {
            id: Uuid::new_v4(),
            target: target.clone(),
            previous_value: Some(recorded),
            new_value: Some(json!({})),
            actor: "import".into(),
            reason: "legacy import".into(),
            timestamp: Utc::now(),
            version: 1,
            kind: ChangeKind::Update,
        })])
        .await
        .unwrap();

    let plan = f.plane.rollback.rollback(&target, 1, &ctx(), true).await.unwrap().plan;
    assert!(!plan.feasible);
    assert_eq!(plan.issues.len(), 1);

    let err = f.plane.rollback.rollback(&target, 1, &ctx(), false).await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
    let flag = f.plane.service.get_flag("newCheckoutFlow").await.unwrap();
    assert_eq!(flag.rollout_percentage, 10);
}
