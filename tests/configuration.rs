//! Reads, writes and cache coherence of configuration values.

use std::time::Duration;

use serde_json::json;

use control_plane::audit::AuditAction;
use control_plane::model::{ConfigurationEntry, DataType, HistoryKey};
use control_plane::service::ValueSource;
use control_plane::config::EnvironmentConfig;
use control_plane::{ControlPlaneConfig, ControlPlaneError};

mod common;

use common::{ctx, settle, Fixture};

#[tokio::test]
async fn test_override_beats_global() {
    let f = Fixture::new();
    f.seed_checkout().await;

    assert_eq!(f.number("checkout.maxRetries", "staging").await, 5.0);
    assert_eq!(f.number("checkout.maxRetries", "production").await, 3.0);
    let dev = f.plane.service.get("checkout.maxRetries", "development").await.unwrap();
    assert_eq!(dev.value.as_f64(), Some(3.0));
    assert_eq!(dev.source, ValueSource::Global);

    let staging = f.plane.service.get("checkout.maxRetries", "staging").await.unwrap();
    assert_eq!(
        staging.source,
        ValueSource::Override {
            environment: "staging".into()
        }
    );
}

#[tokio::test]
async fn test_child_environment_inherits_parent_override() {
    let mut config = ControlPlaneConfig::default();
    config
        .environments
        .declared
        .push(EnvironmentConfig::new("canary").with_parent("production"));
    let f = Fixture::with_config(config);
    f.seed_checkout().await;
    f.set("checkout.maxRetries", "production", json!(7)).await;

    let canary = f.plane.service.get("checkout.maxRetries", "canary").await.unwrap();
    assert_eq!(canary.value.as_f64(), Some(7.0));
    assert_eq!(
        canary.source,
        ValueSource::Override {
            environment: "production".into()
        }
    );

    // The parent's change reaches the child's cached value.
    f.set("checkout.maxRetries", "production", json!(8)).await;
    assert_eq!(f.number("checkout.maxRetries", "canary").await, 8.0);

    f.set("checkout.maxRetries", "canary", json!(1)).await;
    assert_eq!(f.number("checkout.maxRetries", "canary").await, 1.0);
    assert_eq!(f.number("checkout.maxRetries", "production").await, 8.0);
}

#[tokio::test]
async fn test_out_of_range_write_is_rejected_without_side_effects() {
    let f = Fixture::new();
    f.seed_checkout().await;
    let before = f.plane.service.get_entry("checkout.maxRetries").await.unwrap();
    let history = HistoryKey::configuration("checkout.maxRetries", "staging");
    let ledger = f.plane.service.history(&history, 10).await.unwrap().len();

    let err = f
        .plane
        .service
        .set("checkout.maxRetries", json!(15), "staging", &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlPlaneError::Validation { ref key, .. } if key == "checkout.maxRetries"));
    assert!(!err.is_retryable());

    let after = f.plane.service.get_entry("checkout.maxRetries").await.unwrap();
    assert_eq!(after.entry.version, before.entry.version);
    assert_eq!(f.plane.service.history(&history, 10).await.unwrap().len(), ledger);
    assert_eq!(f.number("checkout.maxRetries", "staging").await, 5.0);
}

#[tokio::test]
async fn test_every_write_bumps_version_once() {
    let f = Fixture::new();
    f.seed_checkout().await;
    // create (1), staging (2), production (3)
    let details = f.plane.service.get_entry("checkout.maxRetries").await.unwrap();
    assert_eq!(details.entry.version, 3);

    let outcome = f
        .plane
        .service
        .set("checkout.maxRetries", json!(4), "production", &ctx())
        .await
        .unwrap();
    assert_eq!(outcome.version, 4);
    assert_eq!(outcome.previous_value, Some(json!(3)));
    assert_eq!(f.audit.count(AuditAction::ConfigurationUpdated), 3);
}

#[tokio::test]
async fn test_read_after_write_on_writer() {
    let f = Fixture::new();
    f.seed_checkout().await;
    assert_eq!(f.number("checkout.maxRetries", "production").await, 3.0);

    f.set("checkout.maxRetries", "production", json!(7)).await;
    assert_eq!(f.number("checkout.maxRetries", "production").await, 7.0);
}

#[tokio::test]
async fn test_invalidation_reaches_peer_instance() {
    let f = Fixture::new();
    f.seed_checkout().await;
    let peer = f.peer();

    let cached = peer.service.get("checkout.maxRetries", "production").await.unwrap();
    assert_eq!(cached.value.as_f64(), Some(3.0));

    f.set("checkout.maxRetries", "production", json!(8)).await;
    settle().await;

    let fresh = peer.service.get("checkout.maxRetries", "production").await.unwrap();
    assert_eq!(fresh.value.as_f64(), Some(8.0));
}

#[tokio::test]
async fn test_concurrent_writers_one_conflict() {
    let f = Fixture::new();
    f.seed_checkout().await;
    let version = f.plane.service.get_entry("checkout.maxRetries").await.unwrap().entry.version;
    f.store.set_latency(Duration::from_millis(20));

    let (ctx_a, ctx_b) = (ctx(), ctx());
    let (a, b) = tokio::join!(
        f.plane
            .service
            .set_if_version("checkout.maxRetries", json!(6), "production", version, &ctx_a),
        f.plane
            .service
            .set_if_version("checkout.maxRetries", json!(7), "production", version, &ctx_b),
    );
    f.store.set_latency(Duration::ZERO);

    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(ControlPlaneError::Conflict { .. })))
        .count();
    assert_eq!(conflicts, 1);
    let winner = a.or(b).unwrap();
    assert_eq!(winner.version, version + 1);
    assert_eq!(
        f.number("checkout.maxRetries", "production").await,
        winner.new_value.unwrap().as_f64().unwrap()
    );
}

#[tokio::test]
async fn test_clear_override_falls_back_to_global() {
    let f = Fixture::new();
    f.seed_checkout().await;

    f.plane
        .service
        .clear_override("checkout.maxRetries", "staging", &ctx())
        .await
        .unwrap();
    assert_eq!(f.number("checkout.maxRetries", "staging").await, 3.0);
    assert_eq!(f.audit.count(AuditAction::OverrideCleared), 1);
}

#[tokio::test]
async fn test_stale_read_while_store_down() {
    let f = Fixture::new();
    f.seed_checkout().await;
    assert_eq!(f.number("checkout.maxRetries", "production").await, 3.0);

    f.clock.advance_secs(600);
    f.store.set_available(false);
    f.l2.set_available(false);

    let stale = f.plane.service.get("checkout.maxRetries", "production").await.unwrap();
    assert!(stale.stale);
    assert_eq!(stale.value.as_f64(), Some(3.0));

    let missing = f.plane.service.get("checkout.unknown", "production").await;
    assert!(matches!(missing, Err(ControlPlaneError::StoreUnavailable(_))));
}

#[tokio::test]
async fn test_unknown_key_uses_caller_default() {
    let f = Fixture::new();
    let value = f
        .plane
        .service
        .get_or("checkout.missing", "production", json!(42))
        .await
        .unwrap();
    assert_eq!(value.as_f64(), Some(42.0));
}

#[tokio::test]
async fn test_sensitive_values_are_redacted_in_metadata() {
    let f = Fixture::new();
    f.create(
        ConfigurationEntry::new("payments.apiKey", DataType::String)
            .with_value(json!("sk_live_123"))
            .sensitive(),
    )
    .await;

    let details = f.plane.service.get_entry("payments.apiKey").await.unwrap();
    assert_ne!(details.entry.value, Some(json!("sk_live_123")));
    let resolved = f.plane.service.get("payments.apiKey", "production").await.unwrap();
    assert_eq!(resolved.value.as_str(), Some("sk_live_123"));
}

#[tokio::test]
async fn test_deactivated_entry_reads_as_unknown() {
    let f = Fixture::new();
    f.seed_checkout().await;
    assert_eq!(f.number("checkout.maxRetries", "staging").await, 5.0);

    f.plane
        .service
        .deactivate_entry("checkout.maxRetries", &ctx())
        .await
        .unwrap();

    let err = f.plane.service.get("checkout.maxRetries", "global").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::NotFound { .. }));
    let fallback = f
        .plane
        .service
        .get_or("checkout.maxRetries", "global", json!(1))
        .await
        .unwrap();
    assert_eq!(fallback.as_f64(), Some(1.0));
    assert_eq!(f.audit.count(AuditAction::ConfigurationDeactivated), 1);

    // The entry is kept with its history.
    let details = f.plane.service.get_entry("checkout.maxRetries").await.unwrap();
    assert!(!details.entry.is_active);
}
