//! Template preview and application.

use serde_json::json;

use control_plane::audit::AuditAction;
use control_plane::model::{
    ChangeKind, ConfigurationEntry, ConfigurationTemplate, DataType, FlagPatch, HistoryKey,
    ValidationRule,
};
use control_plane::service::{ItemOutcome, PartialFailurePolicy};
use control_plane::templates::ItemKind;
use control_plane::ControlPlaneError;

mod common;

use common::{ctx, Fixture};

async fn black_friday(f: &Fixture) {
    f.seed_checkout().await;
    f.create(
        ConfigurationEntry::new("checkout.timeoutMs", DataType::Number)
            .with_value(json!(3000))
            .with_validation(ValidationRule::range(100.0, 10_000.0)),
    )
    .await;
    f.plane
        .templates
        .save_template(
            ConfigurationTemplate::new("black-friday-2024")
                .with_value("checkout.maxRetries", json!(1))
                .with_value("checkout.timeoutMs", json!(99_999))
                .with_flag("newCheckoutFlow", FlagPatch::enable()),
            &ctx(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_preview_reports_changes_without_side_effects() {
    let f = Fixture::new();
    black_friday(&f).await;
    let events = f.audit.events().len();
    let ledger = HistoryKey::configuration("checkout.maxRetries", "production");
    let recorded = f.plane.service.history(&ledger, 50).await.unwrap().len();

    let preview = f
        .plane
        .templates
        .preview("black-friday-2024", "production")
        .await
        .unwrap();
    assert_eq!(preview.template_version, 1);
    assert!(!preview.is_clean());

    let retries = preview.items.iter().find(|i| i.key == "checkout.maxRetries").unwrap();
    assert_eq!(retries.current, Some(json!(3)));
    assert_eq!(retries.proposed, Some(json!(1)));
    assert!(retries.changes && retries.issue.is_none());

    let timeout = preview.items.iter().find(|i| i.key == "checkout.timeoutMs").unwrap();
    assert!(timeout.issue.is_some());

    let flag = preview.items.iter().find(|i| i.kind == ItemKind::Flag).unwrap();
    assert_eq!(flag.current, None);
    assert!(flag.changes);

    assert_eq!(f.audit.events().len(), events);
    assert_eq!(f.plane.service.history(&ledger, 50).await.unwrap().len(), recorded);
    assert_eq!(f.number("checkout.maxRetries", "production").await, 3.0);
    assert!(matches!(
        f.plane.service.get_flag("newCheckoutFlow").await,
        Err(ControlPlaneError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_best_effort_applies_valid_items() {
    let f = Fixture::new();
    black_friday(&f).await;

    let application = f
        .plane
        .templates
        .apply("black-friday-2024", "production", PartialFailurePolicy::BestEffort, &ctx())
        .await
        .unwrap();
    let report = &application.report;
    assert!(report.committed);
    assert_eq!(report.applied(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(report.outcomes[1], ItemOutcome::Failed(ControlPlaneError::Validation { .. })));

    assert_eq!(f.number("checkout.maxRetries", "production").await, 1.0);
    assert_eq!(f.number("checkout.timeoutMs", "production").await, 3000.0);
    assert!(f.plane.service.get_flag("newCheckoutFlow").await.unwrap().enabled);

    let history = f
        .plane
        .rollback
        .config_history("checkout.maxRetries", "production", 1)
        .await
        .unwrap();
    assert_eq!(
        history[0].kind,
        ChangeKind::Template {
            template_id: "black-friday-2024".into(),
            template_version: 1,
        }
    );

    let template = f.plane.templates.get_template("black-friday-2024").await.unwrap();
    assert_eq!(template.usage.count, 1);
    assert_eq!(template.usage.last_applied_version, Some(1));
    assert_eq!(f.audit.count(AuditAction::TemplateApplied), 1);
}

#[tokio::test]
async fn test_abort_all_leaves_everything_untouched() {
    let f = Fixture::new();
    black_friday(&f).await;

    let application = f
        .plane
        .templates
        .apply("black-friday-2024", "production", PartialFailurePolicy::AbortAll, &ctx())
        .await
        .unwrap();
    let report = &application.report;
    assert!(!report.committed);
    assert_eq!(report.applied(), 0);
    assert!(matches!(report.outcomes[0], ItemOutcome::Skipped));
    assert!(matches!(report.outcomes[2], ItemOutcome::Skipped));

    assert_eq!(f.number("checkout.maxRetries", "production").await, 3.0);
    assert!(f.plane.service.get_flag("newCheckoutFlow").await.is_err());
    let template = f.plane.templates.get_template("black-friday-2024").await.unwrap();
    assert_eq!(template.usage.count, 0);
}

#[tokio::test]
async fn test_scoped_template_rejects_other_environment() {
    let f = Fixture::new();
    f.seed_checkout().await;
    f.plane
        .templates
        .save_template(
            ConfigurationTemplate::new("prod-only")
                .with_value("checkout.maxRetries", json!(2))
                .scoped_to("production"),
            &ctx(),
        )
        .await
        .unwrap();

    let err = f.plane.templates.preview("prod-only", "staging").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
}
