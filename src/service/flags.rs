//! Feature flag definitions.
//!
//! Flags go through the same pipeline as configuration values: validated,
//! version-checked, recorded in history, audited and invalidated fleet-wide.
//! Evaluation lives in `crate::flags`.

use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{self, AuditAction, AuditEvent};
use crate::cache::flag_l2_key;
use crate::error::{ControlPlaneError, ControlPlaneResult, EntityKind};
use crate::model::{
    ChangeContext, ChangeKind, ChangeRecord, Condition, FeatureFlag, FlagPatch, HistoryKey,
    Operator, Schedule, TargetingRule,
};
use crate::resilience::timeouts;
use crate::service::write::{finish_metric, outcome};
use crate::service::{ConfigurationService, WriteOutcome};
use crate::store::Mutation;
use crate::validator::RuleViolation;

/// A checked flag change, ready to commit.
#[derive(Debug, Clone)]
pub(crate) struct PreparedFlag {
    pub previous: Option<FeatureFlag>,
    pub next: FeatureFlag,
}

impl PreparedFlag {
    pub fn previous_definition(&self) -> Option<Value> {
        self.previous.as_ref().map(FeatureFlag::definition_json)
    }
}

/// Fields restored by a flag rollback.
#[derive(Debug, Deserialize)]
struct Definition {
    enabled: bool,
    default_value: bool,
    rollout_percentage: u8,
    #[serde(default)]
    bucketing_seed: String,
    #[serde(default)]
    rules: Vec<TargetingRule>,
    #[serde(default)]
    schedule: Option<Schedule>,
}

impl ConfigurationService {
    pub async fn create_flag(
        &self,
        flag: FeatureFlag,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        let started = Instant::now();
        let result = async {
            if self.load_flag(&flag.key).await?.is_some() {
                return Err(ControlPlaneError::InvalidRequest(format!(
                    "feature flag '{}' already exists",
                    flag.key
                )));
            }
            let prepared = PreparedFlag {
                previous: None,
                next: flag,
            };
            self.validate_flag(&prepared.next)?;
            self.commit_flag(prepared, ctx, ChangeKind::Create).await
        }
        .await;
        finish_metric("flag", &result, started);
        result
    }

    /// Apply a partial change to an existing flag.
    pub async fn update_flag(
        &self,
        key: &str,
        patch: &FlagPatch,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        let started = Instant::now();
        let result = async {
            let prepared = self.prepare_flag_patch(key, patch).await?;
            self.commit_flag(prepared, ctx, ChangeKind::Update).await
        }
        .await;
        finish_metric("flag", &result, started);
        result
    }

    /// Current definition straight from L2 or the store.
    pub async fn get_flag(&self, key: &str) -> ControlPlaneResult<FeatureFlag> {
        self.fetch_flag(key)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found(EntityKind::Flag, key))
    }

    /// L2, then store. Fills both cache tiers on the way out.
    pub(crate) async fn fetch_flag(&self, key: &str) -> ControlPlaneResult<Option<FeatureFlag>> {
        let l2_key = flag_l2_key(key);
        let cached = timeouts::cache_call(self.config.store.cache_timeout(), self.deps.l2.get(&l2_key))
            .await;
        if let Ok(Some(payload)) = cached {
            match serde_json::from_str::<FeatureFlag>(&payload) {
                Ok(flag) => {
                    self.flags.insert(key.to_string(), flag.clone());
                    return Ok(Some(flag));
                }
                Err(e) => tracing::warn!(flag = key, error = %e, "Discarding corrupt L2 flag"),
            }
        }

        let Some(flag) = self.load_flag(key).await? else {
            return Ok(None);
        };
        match serde_json::to_string(&flag) {
            Ok(payload) => {
                let stored = timeouts::cache_call(
                    self.config.store.cache_timeout(),
                    self.deps.l2.set(&l2_key, payload, self.config.cache.l2_ttl()),
                )
                .await;
                if let Err(e) = stored {
                    tracing::debug!(flag = key, error = %e, "L2 flag fill failed");
                }
            }
            Err(e) => tracing::warn!(flag = key, error = %e, "Failed to encode flag for L2"),
        }
        self.flags.insert(key.to_string(), flag.clone());
        Ok(Some(flag))
    }

    pub(crate) async fn load_flag(&self, key: &str) -> ControlPlaneResult<Option<FeatureFlag>> {
        Ok(timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.load_flag(key),
        )
        .await?)
    }

    pub(crate) async fn prepare_flag_patch(
        &self,
        key: &str,
        patch: &FlagPatch,
    ) -> ControlPlaneResult<PreparedFlag> {
        let current = self
            .load_flag(key)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found(EntityKind::Flag, key))?;
        let mut next = current.clone();
        next.apply_patch(patch);
        self.validate_flag(&next)?;
        Ok(PreparedFlag {
            previous: Some(current),
            next,
        })
    }

    /// Patch an existing flag, or create it from the patch when missing.
    pub(crate) async fn prepare_flag_upsert(
        &self,
        key: &str,
        patch: &FlagPatch,
    ) -> ControlPlaneResult<PreparedFlag> {
        let previous = self.load_flag(key).await?;
        let mut next = previous
            .clone()
            .unwrap_or_else(|| FeatureFlag::new(key));
        next.apply_patch(patch);
        self.validate_flag(&next)?;
        Ok(PreparedFlag { previous, next })
    }

    /// Restore a recorded definition onto the current flag.
    pub(crate) async fn put_flag_definition(
        &self,
        key: &str,
        definition: &Value,
        expected_version: Option<u64>,
        ctx: &ChangeContext,
        kind: ChangeKind,
    ) -> ControlPlaneResult<WriteOutcome> {
        let started = Instant::now();
        let result = async {
            let current = self
                .load_flag(key)
                .await?
                .ok_or_else(|| ControlPlaneError::not_found(EntityKind::Flag, key))?;
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(ControlPlaneError::Conflict {
                        key: key.to_string(),
                        expected,
                        actual: current.version,
                    });
                }
            }
            let next = self.restored_flag(&current, definition)?;
            self.commit_flag(
                PreparedFlag {
                    previous: Some(current),
                    next,
                },
                ctx,
                kind,
            )
            .await
        }
        .await;
        finish_metric("flag", &result, started);
        result
    }

    async fn commit_flag(
        &self,
        prepared: PreparedFlag,
        ctx: &ChangeContext,
        kind: ChangeKind,
    ) -> ControlPlaneResult<WriteOutcome> {
        let (mutations, record, prepared) = self.flag_mutations(prepared, ctx, kind);
        self.commit(mutations).await?;
        self.after_flag_write(&prepared, &record).await;
        Ok(outcome(&record))
    }

    /// Mutations for one flag write. The returned flag carries the new
    /// version and bookkeeping.
    pub(crate) fn flag_mutations(
        &self,
        mut prepared: PreparedFlag,
        ctx: &ChangeContext,
        kind: ChangeKind,
    ) -> (Vec<Mutation>, ChangeRecord, PreparedFlag) {
        let now = self.deps.clock.now();
        let expected_version = prepared.previous.as_ref().map(|f| f.version);
        prepared.next.version = expected_version.unwrap_or(0) + 1;
        prepared.next.updated_at = now;
        prepared.next.updated_by = Some(ctx.actor.clone());

        let record = ChangeRecord {
            id: Uuid::new_v4(),
            target: HistoryKey::flag(&prepared.next.key),
            previous_value: prepared.previous_definition(),
            new_value: Some(prepared.next.definition_json()),
            actor: ctx.actor.clone(),
            reason: ctx.reason.clone(),
            timestamp: now,
            version: prepared.next.version,
            kind,
        };
        let mutations = vec![
            Mutation::PutFlag {
                flag: prepared.next.clone(),
                expected_version,
            },
            Mutation::AppendHistory(record.clone()),
        ];
        (mutations, record, prepared)
    }

    pub(crate) async fn after_flag_write(&self, prepared: &PreparedFlag, record: &ChangeRecord) {
        let flag = &prepared.next;
        self.propagate_flag(&flag.key).await;
        tracing::info!(
            flag = %flag.key,
            enabled = flag.enabled,
            rollout = flag.rollout_percentage,
            version = flag.version,
            actor = %record.actor,
            "Feature flag updated"
        );

        let action = match record.kind {
            ChangeKind::Create => AuditAction::FlagCreated,
            ChangeKind::Rollback { .. } => AuditAction::Rollback,
            _ => AuditAction::FlagUpdated,
        };
        audit::emit(
            self.audit(),
            AuditEvent::new(action, &record.actor, &record.reason, &flag.key, record.timestamp)
                .at_version(flag.version)
                .with_details(json!({
                    "previous": record.previous_value,
                    "new": record.new_value,
                    "change_id": record.id,
                })),
        )
        .await;
    }

    /// `current` with a recorded definition laid over it, validated.
    pub(crate) fn restored_flag(
        &self,
        current: &FeatureFlag,
        definition: &Value,
    ) -> ControlPlaneResult<FeatureFlag> {
        let restored: Definition = serde_json::from_value(definition.clone()).map_err(|e| {
            ControlPlaneError::InvalidRequest(format!(
                "recorded definition of '{}' is unreadable: {e}",
                current.key
            ))
        })?;
        let mut next = current.clone();
        next.enabled = restored.enabled;
        next.default_value = restored.default_value;
        next.rollout_percentage = restored.rollout_percentage;
        next.bucketing_seed = restored.bucketing_seed;
        next.rules = restored.rules;
        next.schedule = restored.schedule;
        self.validate_flag(&next)?;
        Ok(next)
    }

    /// Structural checks on a complete definition.
    pub(crate) fn validate_flag(&self, flag: &FeatureFlag) -> ControlPlaneResult<()> {
        if flag.key.trim().is_empty() || flag.key.chars().any(char::is_whitespace) {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "invalid flag key '{}'",
                flag.key
            )));
        }
        if flag.rollout_percentage > 100 {
            return Err(ControlPlaneError::Validation {
                key: flag.key.clone(),
                violations: vec![RuleViolation::AboveMaximum { max: 100.0 }],
            });
        }
        if let Some(Schedule {
            starts_at: Some(start),
            ends_at: Some(end),
        }) = &flag.schedule
        {
            if start >= end {
                return Err(ControlPlaneError::InvalidRequest(format!(
                    "schedule of '{}' ends before it starts",
                    flag.key
                )));
            }
        }

        let mut violations = Vec::new();
        for rule in &flag.rules {
            self.check_condition(&rule.condition, &mut violations);
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ControlPlaneError::Validation {
                key: flag.key.clone(),
                violations,
            })
        }
    }

    fn check_condition(&self, condition: &Condition, violations: &mut Vec<RuleViolation>) {
        match condition {
            Condition::All(children) | Condition::Any(children) => {
                for child in children {
                    self.check_condition(child, violations);
                }
            }
            Condition::Not(inner) => self.check_condition(inner, violations),
            Condition::Match {
                operator, value, ..
            } => match operator {
                Operator::Matches => match value.as_str() {
                    Some(pattern) => {
                        if let Err(e) = self.validator.regexes().get_or_compile(pattern) {
                            violations.push(RuleViolation::InvalidPattern {
                                pattern: pattern.to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                    None => violations.push(RuleViolation::Custom {
                        name: "matches".to_string(),
                        message: "pattern must be a string".to_string(),
                    }),
                },
                Operator::OneOf | Operator::NotOneOf if !value.is_array() => {
                    violations.push(RuleViolation::Custom {
                        name: "one_of".to_string(),
                        message: "candidates must be an array".to_string(),
                    });
                }
                _ => {}
            },
        }
    }
}
