//! Configuration templates.
//!
//! # Responsibilities
//! - Store versioned bundles of value and flag changes
//! - Preview a bundle against one environment without side effects
//! - Apply it as one bulk write and keep usage statistics
//!
//! # Data Flow
//! ```text
//! apply(id, env, policy)
//!     → load template, check its environment scope
//!     → bulk write (ChangeKind::Template { id, version })
//!     → usage stats, metric, one audit event
//! ```
//!
//! # Design Decisions
//! - Every change record produced by an application names the template
//!   version, so an apply at time T stays distinguishable from later edits
//! - Usage statistics are best effort; a failed update never undoes the
//!   application it describes

pub mod preview;

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::audit::{self, AuditAction, AuditEvent};
use crate::error::{ControlPlaneError, ControlPlaneResult, EntityKind};
use crate::model::{ChangeContext, ChangeKind, ChangeRecord, ConfigurationTemplate, HistoryKey};
use crate::observability::metrics;
use crate::resilience::timeouts;
use crate::service::{BulkItem, BulkReport, ConfigurationService, PartialFailurePolicy};
use crate::store::Mutation;

pub use preview::{ItemKind, PreviewItem, TemplatePreview};

/// Result of applying a template.
#[derive(Debug, Clone)]
pub struct TemplateApplication {
    pub template_id: String,
    pub template_version: u64,
    pub environment: String,
    pub report: BulkReport,
}

#[derive(Debug, Clone)]
pub struct TemplateEngine {
    service: Arc<ConfigurationService>,
}

impl TemplateEngine {
    pub fn new(service: Arc<ConfigurationService>) -> Self {
        Self { service }
    }

    /// Create or replace a template definition, bumping its version.
    pub async fn save_template(
        &self,
        mut template: ConfigurationTemplate,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<ConfigurationTemplate> {
        if template.id.trim().is_empty() || template.id.chars().any(char::is_whitespace) {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "invalid template id '{}'",
                template.id
            )));
        }
        if template.is_empty() {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "template '{}' has no items",
                template.id
            )));
        }
        if let Some(env) = &template.environment {
            let envs = self.service.environments();
            if !envs.is_global(env) && !envs.is_declared(env) {
                return Err(ControlPlaneError::InvalidRequest(format!(
                    "template '{}' is scoped to unknown environment '{env}'",
                    template.id
                )));
            }
        }

        let existing = self.load(&template.id).await?;
        let now = self.service.clock().now();
        template.version = existing.as_ref().map_or(0, |t| t.version) + 1;
        template.usage = existing
            .as_ref()
            .map(|t| t.usage.clone())
            .unwrap_or_default();
        template.updated_at = now;
        template.is_active = true;

        let record = ChangeRecord {
            id: Uuid::new_v4(),
            target: HistoryKey::template(&template.id),
            previous_value: existing.as_ref().and_then(|t| serde_json::to_value(t).ok()),
            new_value: serde_json::to_value(&template).ok(),
            actor: ctx.actor.clone(),
            reason: ctx.reason.clone(),
            timestamp: now,
            version: template.version,
            kind: if existing.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            },
        };
        self.service
            .commit(vec![
                Mutation::PutTemplate {
                    template: template.clone(),
                    expected_version: existing.as_ref().map(|t| t.version),
                },
                Mutation::AppendHistory(record),
            ])
            .await?;

        tracing::info!(
            template = %template.id,
            version = template.version,
            values = template.values.len(),
            flags = template.flags.len(),
            actor = %ctx.actor,
            "Template saved"
        );
        audit::emit(
            self.service.audit(),
            AuditEvent::new(
                AuditAction::TemplateSaved,
                &ctx.actor,
                &ctx.reason,
                &template.id,
                now,
            )
            .at_version(template.version),
        )
        .await;
        Ok(template)
    }

    pub async fn get_template(&self, id: &str) -> ControlPlaneResult<ConfigurationTemplate> {
        match self.load(id).await? {
            Some(template) if template.is_active => Ok(template),
            _ => Err(ControlPlaneError::not_found(EntityKind::Template, id)),
        }
    }

    /// Diff of `id` against `environment`. Writes nothing.
    pub async fn preview(&self, id: &str, environment: &str) -> ControlPlaneResult<TemplatePreview> {
        let template = self.get_template(id).await?;
        check_scope(&template, environment)?;
        let items = bulk_items(&template, environment);
        let plan = self.service.dry_run_bulk(&items).await?;
        Ok(TemplatePreview {
            template_id: template.id.clone(),
            template_version: template.version,
            environment: environment.to_string(),
            items: items
                .iter()
                .zip(&plan)
                .map(|(item, planned)| preview::preview_item(item, planned))
                .collect(),
        })
    }

    /// Apply `id` to `environment` as one bulk write.
    pub async fn apply(
        &self,
        id: &str,
        environment: &str,
        policy: PartialFailurePolicy,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<TemplateApplication> {
        let template = self.get_template(id).await?;
        check_scope(&template, environment)?;
        let items = bulk_items(&template, environment);
        let kind = ChangeKind::Template {
            template_id: template.id.clone(),
            template_version: template.version,
        };

        let report = match self.service.bulk_write(&items, policy, ctx, kind).await {
            Ok(report) => report,
            Err(e) => {
                metrics::record_template_applied(id, "error");
                return Err(e);
            }
        };

        let outcome = if !report.committed {
            "aborted"
        } else if report.is_complete() {
            "complete"
        } else {
            "partial"
        };
        metrics::record_template_applied(id, outcome);

        let now = self.service.clock().now();
        if report.committed {
            self.record_usage(&template, now).await;
        }

        tracing::info!(
            template = id,
            version = template.version,
            environment,
            applied = report.applied(),
            failed = report.failed(),
            outcome,
            actor = %ctx.actor,
            "Template applied"
        );
        audit::emit(
            self.service.audit(),
            AuditEvent::new(AuditAction::TemplateApplied, &ctx.actor, &ctx.reason, id, now)
                .in_environment(environment)
                .at_version(template.version)
                .with_details(json!({
                    "policy": policy,
                    "outcome": outcome,
                    "applied": report.applied(),
                    "failed": report.failed(),
                })),
        )
        .await;

        Ok(TemplateApplication {
            template_id: template.id,
            template_version: template.version,
            environment: environment.to_string(),
            report,
        })
    }

    async fn record_usage(&self, template: &ConfigurationTemplate, now: chrono::DateTime<chrono::Utc>) {
        let recorded = self
            .service
            .commit(vec![Mutation::RecordTemplateUsage {
                id: template.id.clone(),
                applied_at: now,
                template_version: template.version,
            }])
            .await;
        if let Err(e) = recorded {
            tracing::warn!(template = %template.id, error = %e, "Failed to record template usage");
        }
    }

    async fn load(&self, id: &str) -> ControlPlaneResult<Option<ConfigurationTemplate>> {
        let store = &self.service.collaborators().store;
        Ok(timeouts::store_call(
            self.service.config().store.call_timeout(),
            store.load_template(id),
        )
        .await?)
    }
}

fn check_scope(template: &ConfigurationTemplate, environment: &str) -> ControlPlaneResult<()> {
    match &template.environment {
        Some(scope) if scope != environment => Err(ControlPlaneError::InvalidRequest(format!(
            "template '{}' only applies to '{scope}'",
            template.id
        ))),
        _ => Ok(()),
    }
}

fn bulk_items(template: &ConfigurationTemplate, environment: &str) -> Vec<BulkItem> {
    template
        .values
        .iter()
        .map(|(key, value)| BulkItem::value(key, environment, value.clone()))
        .chain(
            template
                .flags
                .iter()
                .map(|(key, patch)| BulkItem::flag(key, patch.clone())),
        )
        .collect()
}
