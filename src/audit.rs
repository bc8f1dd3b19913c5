//! Audit event emission.
//!
//! Every successful write, rollback, template application and log-only
//! rate-limit violation produces one [`AuditEvent`]. The control plane never
//! reads events back. Sink failures are logged and swallowed: the change
//! they describe has already been committed.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConfigurationCreated,
    ConfigurationUpdated,
    ConfigurationDeactivated,
    OverrideCleared,
    FlagCreated,
    FlagUpdated,
    Rollback,
    TemplateSaved,
    TemplateApplied,
    RateLimitViolation,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationCreated => "configuration_created",
            Self::ConfigurationUpdated => "configuration_updated",
            Self::ConfigurationDeactivated => "configuration_deactivated",
            Self::OverrideCleared => "override_cleared",
            Self::FlagCreated => "flag_created",
            Self::FlagUpdated => "flag_updated",
            Self::Rollback => "rollback",
            Self::TemplateSaved => "template_saved",
            Self::TemplateApplied => "template_applied",
            Self::RateLimitViolation => "rate_limit_violation",
        }
    }
}

/// One audit record. Sensitive values are redacted before they get here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor: String,
    pub reason: String,
    pub target: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        actor: impl Into<String>,
        reason: impl Into<String>,
        target: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor: actor.into(),
            reason: reason.into(),
            target: target.into(),
            environment: None,
            version: None,
            details: Value::Null,
            timestamp,
        }
    }

    pub fn in_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Pluggable audit backend.
#[async_trait]
pub trait AuditSink: Send + Sync + fmt::Debug {
    async fn record_change(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Record an event, logging instead of failing.
pub(crate) async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action.as_str();
    let target = event.target.clone();
    if let Err(e) = sink.record_change(event).await {
        tracing::warn!(action, target = %target, error = %e, "Failed to record audit event");
    }
}

/// Writes events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_change(&self, event: AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "audit",
            id = %event.id,
            action = event.action.as_str(),
            actor = %event.actor,
            target_key = %event.target,
            environment = event.environment.as_deref().unwrap_or("-"),
            version = event.version.unwrap_or(0),
            reason = %event.reason,
            "Audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory, for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.events.lock().iter().filter(|e| e.action == action).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_change(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}
