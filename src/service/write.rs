//! Validated write path.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{self, AuditAction, AuditEvent};
use crate::error::{ControlPlaneError, ControlPlaneResult, EntityKind};
use crate::model::{
    ChangeContext, ChangeKind, ChangeRecord, ConfigValue, ConfigurationEntry, EnvironmentOverride,
    HistoryKey, ValidationRule,
};
use crate::observability::metrics;
use crate::resilience::timeouts;
use crate::service::read::Overlay;
use crate::service::{ConfigurationService, WriteOutcome};
use crate::store::Mutation;
use crate::validator::{DependencyView, RuleViolation};

/// A checked value write, ready to commit.
#[derive(Debug, Clone)]
pub(crate) struct PreparedWrite {
    pub entry: ConfigurationEntry,
    pub environment: String,
    /// Value at this scope before the write.
    pub previous: Option<Value>,
    /// Canonical JSON of the new value; `None` clears an override.
    pub value: Option<Value>,
    pub typed: Option<ConfigValue>,
}

/// Accumulates every write to one key inside a single commit. Each write
/// gets the next version; the entry row is put once, guarded by the version
/// it was read at.
#[derive(Debug)]
pub(crate) struct KeyWrites {
    original_version: u64,
    next: ConfigurationEntry,
    overrides: Vec<EnvironmentOverride>,
    records: Vec<ChangeRecord>,
    global: String,
}

impl KeyWrites {
    pub fn new(entry: &ConfigurationEntry, global: &str) -> Self {
        Self {
            original_version: entry.version,
            next: entry.clone(),
            overrides: Vec::new(),
            records: Vec::new(),
            global: global.to_string(),
        }
    }

    pub fn push(
        &mut self,
        write: &PreparedWrite,
        ctx: &ChangeContext,
        kind: ChangeKind,
        now: DateTime<Utc>,
    ) -> ChangeRecord {
        self.next.version += 1;
        self.next.updated_at = now;
        self.next.updated_by = Some(ctx.actor.clone());

        if write.environment == self.global {
            self.next.value = write.value.clone();
        } else {
            self.overrides.push(EnvironmentOverride {
                key: write.entry.key.clone(),
                environment: write.environment.clone(),
                value: write
                    .value
                    .clone()
                    .or_else(|| write.previous.clone())
                    .unwrap_or(Value::Null),
                version: self.next.version,
                is_active: write.value.is_some(),
                updated_at: now,
                updated_by: Some(ctx.actor.clone()),
            });
        }

        let record = ChangeRecord {
            id: Uuid::new_v4(),
            target: HistoryKey::configuration(&write.entry.key, &write.environment),
            previous_value: write.previous.clone(),
            new_value: write.value.clone(),
            actor: ctx.actor.clone(),
            reason: ctx.reason.clone(),
            timestamp: now,
            version: self.next.version,
            kind,
        };
        self.records.push(record.clone());
        record
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        let mut mutations = vec![Mutation::PutEntry {
            entry: self.next,
            expected_version: Some(self.original_version),
        }];
        mutations.extend(self.overrides.into_iter().map(Mutation::PutOverride));
        mutations.extend(self.records.into_iter().map(Mutation::AppendHistory));
        mutations
    }
}

impl ConfigurationService {
    /// Validated, version-checked write of `value` at `environment`.
    ///
    /// Writing the global scope sets the entry's own value; any other
    /// environment writes an override.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        environment: &str,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        self.write_config(key, environment, Some(value), None, ctx, ChangeKind::Update)
            .await
    }

    /// Like [`set`](Self::set), failing with `Conflict` unless the entry is
    /// still at `expected_version`.
    pub async fn set_if_version(
        &self,
        key: &str,
        value: Value,
        environment: &str,
        expected_version: u64,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        self.write_config(
            key,
            environment,
            Some(value),
            Some(expected_version),
            ctx,
            ChangeKind::Update,
        )
        .await
    }

    /// Remove the override for `environment`; reads fall back to the parent
    /// chain and global value.
    pub async fn clear_override(
        &self,
        key: &str,
        environment: &str,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        self.write_config(key, environment, None, None, ctx, ChangeKind::Update)
            .await
    }

    /// Check a write without performing it. Returns the typed value.
    pub async fn validate_change(
        &self,
        key: &str,
        environment: &str,
        value: Option<Value>,
    ) -> ControlPlaneResult<Option<ConfigValue>> {
        let prepared = self.prepare_write(key, environment, value, None).await?;
        Ok(prepared.typed)
    }

    pub(crate) async fn write_config(
        &self,
        key: &str,
        environment: &str,
        value: Option<Value>,
        expected_version: Option<u64>,
        ctx: &ChangeContext,
        kind: ChangeKind,
    ) -> ControlPlaneResult<WriteOutcome> {
        let started = Instant::now();
        let result = async {
            let prepared = self
                .prepare_write(key, environment, value, expected_version)
                .await?;
            let now = self.deps.clock.now();
            let mut writes = KeyWrites::new(&prepared.entry, self.environments.global());
            let record = writes.push(&prepared, ctx, kind, now);
            self.commit(writes.into_mutations()).await?;
            self.after_config_write(&prepared, &record).await;
            Ok(outcome(&record))
        }
        .await;
        finish_metric("configuration", &result, started);
        result
    }

    /// Load, type-check, validate and dependency-check one write.
    pub(crate) async fn prepare_write(
        &self,
        key: &str,
        environment: &str,
        value: Option<Value>,
        expected_version: Option<u64>,
    ) -> ControlPlaneResult<PreparedWrite> {
        let entry = self.require_entry(key).await?;
        if let Some(expected) = expected_version {
            if entry.version != expected {
                return Err(ControlPlaneError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual: entry.version,
                });
            }
        }

        let global = self.environments.is_global(environment);
        let previous = if global {
            entry.value.clone()
        } else {
            self.load_override(key, environment).await?.map(|o| o.value)
        };

        let typed = match &value {
            Some(raw) => Some(self.validator.validate(&entry, raw)?),
            None if global => {
                return Err(ControlPlaneError::InvalidRequest(format!(
                    "the global value of '{key}' cannot be cleared; deactivate the entry instead"
                )))
            }
            None if previous.is_none() => {
                return Err(ControlPlaneError::not_found(
                    EntityKind::Configuration,
                    format!("{key}@{environment}"),
                ))
            }
            None => None,
        };

        let prepared = PreparedWrite {
            value: typed.as_ref().map(ConfigValue::to_json),
            typed,
            previous,
            environment: environment.to_string(),
            entry,
        };

        let mut overlay = Overlay::new();
        overlay.insert(
            (key.to_string(), environment.to_string()),
            prepared.value.clone(),
        );
        let view = self
            .dependency_view(environment, &[&prepared.entry], &overlay)
            .await?;
        view.check_change(key)?;

        Ok(prepared)
    }

    /// Create a new entry at version 1.
    pub async fn create_entry(
        &self,
        entry: ConfigurationEntry,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        let started = Instant::now();
        let result = self.create_entry_inner(entry, ctx).await;
        finish_metric("configuration", &result, started);
        result
    }

    async fn create_entry_inner(
        &self,
        mut entry: ConfigurationEntry,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        if entry.key.trim().is_empty() || entry.key.chars().any(char::is_whitespace) {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "invalid configuration key '{}'",
                entry.key
            )));
        }
        if let Some(pattern) = &entry.validation.pattern {
            if let Err(e) = self.validator.regexes().get_or_compile(pattern) {
                return Err(ControlPlaneError::Validation {
                    key: entry.key.clone(),
                    violations: vec![RuleViolation::InvalidPattern {
                        pattern: pattern.clone(),
                        error: e.to_string(),
                    }],
                });
            }
        }

        let typed = match &entry.value {
            Some(raw) => Some(self.validator.validate(&entry, raw)?),
            None => None,
        };
        entry.value = typed.as_ref().map(ConfigValue::to_json);
        if let Some(raw) = &entry.default_value {
            entry.default_value = Some(self.validator.validate(&entry, raw)?.to_json());
        }

        let global = self.environments.global().to_string();
        let mut overlay = Overlay::new();
        overlay.insert((entry.key.clone(), global.clone()), entry.value.clone());
        self.dependency_view(&global, &[&entry], &overlay)
            .await?
            .check_change(&entry.key)?;

        let now = self.deps.clock.now();
        entry.version = 1;
        entry.is_active = true;
        entry.updated_at = now;
        entry.updated_by = Some(ctx.actor.clone());

        let record = ChangeRecord {
            id: Uuid::new_v4(),
            target: HistoryKey::configuration(&entry.key, &global),
            previous_value: None,
            new_value: entry.value.clone(),
            actor: ctx.actor.clone(),
            reason: ctx.reason.clone(),
            timestamp: now,
            version: 1,
            kind: ChangeKind::Create,
        };
        self.commit(vec![
            Mutation::PutEntry {
                entry: entry.clone(),
                expected_version: None,
            },
            Mutation::AppendHistory(record.clone()),
        ])
        .await?;

        self.propagate_config(&entry.key, &global).await;
        let shown = typed
            .as_ref()
            .map(|v| v.display_redacted(entry.is_sensitive))
            .unwrap_or_else(|| "<unset>".to_string());
        tracing::info!(
            key = %entry.key,
            data_type = %entry.data_type,
            value = %shown,
            actor = %ctx.actor,
            "Configuration entry created"
        );
        audit::emit(
            self.audit(),
            AuditEvent::new(
                AuditAction::ConfigurationCreated,
                &ctx.actor,
                &ctx.reason,
                &entry.key,
                now,
            )
            .in_environment(&global)
            .at_version(1)
            .with_details(json!({ "new": redact(&entry.value, entry.is_sensitive) })),
        )
        .await;
        Ok(outcome(&record))
    }

    /// Soft-disable an entry. History is kept; reads report `NotFound`.
    pub async fn deactivate_entry(
        &self,
        key: &str,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<WriteOutcome> {
        let started = Instant::now();
        let result = async {
            let entry = self.require_entry(key).await?;
            let now = self.deps.clock.now();
            let mut next = entry.clone();
            next.is_active = false;
            next.version += 1;
            next.updated_at = now;
            next.updated_by = Some(ctx.actor.clone());

            let global = self.environments.global().to_string();
            let record = ChangeRecord {
                id: Uuid::new_v4(),
                target: HistoryKey::configuration(key, &global),
                previous_value: entry.value.clone(),
                new_value: None,
                actor: ctx.actor.clone(),
                reason: ctx.reason.clone(),
                timestamp: now,
                version: next.version,
                kind: ChangeKind::Deactivate,
            };
            self.commit(vec![
                Mutation::PutEntry {
                    entry: next,
                    expected_version: Some(entry.version),
                },
                Mutation::AppendHistory(record.clone()),
            ])
            .await?;

            self.propagate_config(key, &global).await;
            tracing::info!(key, version = record.version, actor = %ctx.actor, "Configuration entry deactivated");
            audit::emit(
                self.audit(),
                AuditEvent::new(
                    AuditAction::ConfigurationDeactivated,
                    &ctx.actor,
                    &ctx.reason,
                    key,
                    now,
                )
                .at_version(record.version),
            )
            .await;
            Ok(outcome(&record))
        }
        .await;
        finish_metric("configuration", &result, started);
        result
    }

    /// Entries reachable from `written` plus the entries whose rules point
    /// at a written key, with `overlay` applied, in one environment.
    pub(crate) async fn dependency_view(
        &self,
        environment: &str,
        written: &[&ConfigurationEntry],
        overlay: &Overlay,
    ) -> ControlPlaneResult<DependencyView> {
        let mut view = DependencyView::new();
        for entry in written {
            let value = self.effective_value(entry, environment, overlay).await?;
            view.insert_proposed(entry.key.clone(), entry.validation.clone(), value);
        }
        for entry in written {
            let dependents = timeouts::store_call(
                self.config.store.call_timeout(),
                self.deps.store.list_dependents(&entry.key),
            )
            .await?;
            for dependent in dependents {
                if view.contains(&dependent.key) {
                    continue;
                }
                let value = self.effective_value(&dependent, environment, overlay).await?;
                view.insert_current(dependent.key.clone(), dependent.validation.clone(), value);
            }
        }
        loop {
            let missing = view.unresolved_keys();
            if missing.is_empty() {
                break;
            }
            for key in missing {
                match self.load_entry(&key).await? {
                    Some(entry) if entry.is_active => {
                        let value = self.effective_value(&entry, environment, overlay).await?;
                        view.insert_current(key, entry.validation.clone(), value);
                    }
                    _ => view.insert_current(key, ValidationRule::default(), None),
                }
            }
        }
        Ok(view)
    }

    pub(crate) async fn commit(&self, mutations: Vec<Mutation>) -> ControlPlaneResult<()> {
        Ok(timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.commit(mutations),
        )
        .await?)
    }

    /// Cache fan-out, log line and audit event for a committed value write.
    pub(crate) async fn after_config_write(&self, write: &PreparedWrite, record: &ChangeRecord) {
        let key = &write.entry.key;
        self.propagate_config(key, &write.environment).await;

        let sensitive = write.entry.is_sensitive;
        let shown = write
            .typed
            .as_ref()
            .map(|v| v.display_redacted(sensitive))
            .unwrap_or_else(|| "<cleared>".to_string());
        tracing::info!(
            key = %key,
            environment = %write.environment,
            version = record.version,
            actor = %record.actor,
            value = %shown,
            requires_restart = write.entry.requires_restart,
            "Configuration updated"
        );

        let action = match (&record.kind, &write.value) {
            (ChangeKind::Rollback { .. }, _) => AuditAction::Rollback,
            (_, None) => AuditAction::OverrideCleared,
            _ => AuditAction::ConfigurationUpdated,
        };
        audit::emit(
            self.audit(),
            AuditEvent::new(action, &record.actor, &record.reason, key, record.timestamp)
                .in_environment(&write.environment)
                .at_version(record.version)
                .with_details(json!({
                    "previous": redact(&record.previous_value, sensitive),
                    "new": redact(&record.new_value, sensitive),
                    "change_id": record.id,
                })),
        )
        .await;
    }
}

pub(crate) fn outcome(record: &ChangeRecord) -> WriteOutcome {
    WriteOutcome {
        key: record.target.key.clone(),
        environment: record.target.environment.clone(),
        version: record.version,
        previous_value: record.previous_value.clone(),
        new_value: record.new_value.clone(),
        change_id: record.id,
    }
}

pub(crate) fn redact(value: &Option<Value>, sensitive: bool) -> Value {
    match value {
        Some(_) if sensitive => Value::String("[redacted]".to_string()),
        Some(v) => v.clone(),
        None => Value::Null,
    }
}

pub(crate) fn finish_metric<T>(
    entity: &'static str,
    result: &ControlPlaneResult<T>,
    started: Instant,
) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.as_str(),
    };
    metrics::record_write(entity, outcome, started);
}
