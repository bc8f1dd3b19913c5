//! Change history and rollback.
//!
//! # Responsibilities
//! - Expose the per-target change ledger, newest first
//! - Project the value a target held `n` changes ago and check whether
//!   writing it back would pass validation today
//! - Perform the rollback as a new forward write through the service
//!
//! # Data Flow
//! ```text
//! rollback(target, n)
//!     → load last n ChangeRecords
//!     → projected = previous_value of the oldest of them
//!     → dry run: validation + dependency checks, report feasibility
//!     → apply: versioned write with ChangeKind::Rollback
//! ```
//!
//! # Design Decisions
//! - History is append-only; a rollback never edits or removes records
//! - The apply step pins the version read while planning, so a change
//!   landing in between fails with `Conflict` instead of being undone
//!   blindly

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{ControlPlaneError, ControlPlaneResult, EntityKind};
use crate::model::{ChangeContext, ChangeKind, ChangeRecord, EntityType, HistoryKey};
use crate::service::{ConfigurationService, WriteOutcome};

const REDACTED: &str = "[redacted]";

/// What a rollback would do. Values of sensitive entries are redacted.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackPlan {
    pub target: HistoryKey,
    pub steps: usize,
    /// Record whose previous state is being restored.
    pub reverted_to: Uuid,
    pub current_value: Option<Value>,
    /// `None` clears an override.
    pub projected_value: Option<Value>,
    pub feasible: bool,
    pub issues: Vec<String>,
    /// Version the apply step requires the target to still be at.
    pub expected_version: u64,
    restore: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackOutcome {
    pub plan: RollbackPlan,
    /// Set when the rollback was written.
    pub applied: Option<WriteOutcome>,
}

/// Rolls configuration values and flag definitions back through the
/// normal write path.
#[derive(Debug, Clone)]
pub struct RollbackEngine {
    service: Arc<ConfigurationService>,
}

impl RollbackEngine {
    pub fn new(service: Arc<ConfigurationService>) -> Self {
        Self { service }
    }

    /// Ledger of a configuration value in one environment, newest first.
    pub async fn config_history(
        &self,
        key: &str,
        environment: &str,
        limit: usize,
    ) -> ControlPlaneResult<Vec<ChangeRecord>> {
        self.service
            .history(&HistoryKey::configuration(key, environment), limit)
            .await
    }

    pub async fn flag_history(&self, key: &str, limit: usize) -> ControlPlaneResult<Vec<ChangeRecord>> {
        self.service.history(&HistoryKey::flag(key), limit).await
    }

    /// Restore the state `target` had `steps` changes ago.
    ///
    /// With `dry_run` nothing is written; the plan reports the projected
    /// value and whether the write would be accepted.
    pub async fn rollback(
        &self,
        target: &HistoryKey,
        steps: usize,
        ctx: &ChangeContext,
        dry_run: bool,
    ) -> ControlPlaneResult<RollbackOutcome> {
        let plan = self.plan(target, steps).await?;
        if dry_run {
            tracing::debug!(target = %target, steps, feasible = plan.feasible, "Rollback dry run");
            return Ok(RollbackOutcome {
                plan,
                applied: None,
            });
        }
        if !plan.feasible {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "rollback of {target} by {steps} is not possible: {}",
                plan.issues.join("; ")
            )));
        }

        let kind = ChangeKind::Rollback {
            steps,
            reverted_to: plan.reverted_to,
        };
        let applied = match target.entity {
            EntityType::Configuration => {
                let environment = config_environment(target)?;
                self.service
                    .write_config(
                        &target.key,
                        environment,
                        plan.restore.clone(),
                        Some(plan.expected_version),
                        ctx,
                        kind,
                    )
                    .await?
            }
            EntityType::Flag => {
                let definition = plan.restore.clone().ok_or_else(|| {
                    ControlPlaneError::InvalidRequest("no flag definition to restore".to_string())
                })?;
                self.service
                    .put_flag_definition(
                        &target.key,
                        &definition,
                        Some(plan.expected_version),
                        ctx,
                        kind,
                    )
                    .await?
            }
            EntityType::Template => return Err(unsupported(target)),
        };

        tracing::info!(
            target = %target,
            steps,
            reverted_to = %plan.reverted_to,
            version = applied.version,
            actor = %ctx.actor,
            "Rollback applied"
        );
        Ok(RollbackOutcome {
            plan,
            applied: Some(applied),
        })
    }

    async fn plan(&self, target: &HistoryKey, steps: usize) -> ControlPlaneResult<RollbackPlan> {
        if steps == 0 {
            return Err(ControlPlaneError::InvalidRequest(
                "rollback needs at least one step".to_string(),
            ));
        }
        let records = self.service.history(target, steps).await?;
        let Some(oldest) = records.get(steps - 1) else {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "{target} has only {} recorded change(s)",
                records.len()
            )));
        };
        let restore = oldest.previous_value.clone();
        let mut issues = Vec::new();

        let (current, expected_version, sensitive) = match target.entity {
            EntityType::Configuration => {
                let environment = config_environment(target)?;
                let entry = self.service.require_entry(&target.key).await?;
                let global = self.service.environments().is_global(environment);
                let current = if global {
                    entry.value.clone()
                } else {
                    self.service
                        .load_override(&target.key, environment)
                        .await?
                        .map(|o| o.value)
                };

                if restore.is_none() && global {
                    issues.push("the entry had no global value before that change".to_string());
                } else if restore == current {
                    issues.push("the target already holds that value".to_string());
                } else if let Err(e) = self
                    .service
                    .validate_change(&target.key, environment, restore.clone())
                    .await
                {
                    issues.push(e.to_string());
                }
                (current, entry.version, entry.is_sensitive)
            }
            EntityType::Flag => {
                let flag = self
                    .service
                    .load_flag(&target.key)
                    .await?
                    .ok_or_else(|| ControlPlaneError::not_found(EntityKind::Flag, &target.key))?;
                let current = Some(flag.definition_json());
                match &restore {
                    None => issues.push("the flag did not exist before that change".to_string()),
                    Some(definition) if Some(definition) == current.as_ref() => {
                        issues.push("the flag already has that definition".to_string())
                    }
                    Some(definition) => {
                        if let Err(e) = self.service.restored_flag(&flag, definition) {
                            issues.push(e.to_string());
                        }
                    }
                }
                (current, flag.version, false)
            }
            EntityType::Template => return Err(unsupported(target)),
        };

        Ok(RollbackPlan {
            target: target.clone(),
            steps,
            reverted_to: oldest.id,
            current_value: redact(&current, sensitive),
            projected_value: redact(&restore, sensitive),
            feasible: issues.is_empty(),
            issues,
            expected_version,
            restore,
        })
    }
}

fn config_environment(target: &HistoryKey) -> ControlPlaneResult<&str> {
    target.environment.as_deref().ok_or_else(|| {
        ControlPlaneError::InvalidRequest(format!("{target} names no environment"))
    })
}

fn unsupported(target: &HistoryKey) -> ControlPlaneError {
    ControlPlaneError::InvalidRequest(format!(
        "{} '{}' cannot be rolled back",
        EntityKind::Template,
        target.key
    ))
}

fn redact(value: &Option<Value>, sensitive: bool) -> Option<Value> {
    match value {
        Some(_) if sensitive => Some(Value::String(REDACTED.to_string())),
        other => other.clone(),
    }
}
