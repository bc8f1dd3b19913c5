//! Immutable change records: the rollback ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Configuration,
    Flag,
    Template,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Flag => "flag",
            Self::Template => "template",
        }
    }
}

/// Identifies one ordered history stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryKey {
    pub entity: EntityType,
    pub key: String,
    /// Set for configuration values only.
    pub environment: Option<String>,
}

impl HistoryKey {
    pub fn configuration(key: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            entity: EntityType::Configuration,
            key: key.into(),
            environment: Some(environment.into()),
        }
    }

    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            entity: EntityType::Flag,
            key: key.into(),
            environment: None,
        }
    }

    pub fn template(id: impl Into<String>) -> Self {
        Self {
            entity: EntityType::Template,
            key: id.into(),
            environment: None,
        }
    }
}

impl std::fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.environment {
            Some(env) => write!(f, "{}:{}@{}", self.entity.as_str(), self.key, env),
            None => write!(f, "{}:{}", self.entity.as_str(), self.key),
        }
    }
}

/// Why a change happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Deactivate,
    Rollback { steps: usize, reverted_to: Uuid },
    Template { template_id: String, template_version: u64 },
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub target: HistoryKey,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub actor: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Version produced by this change.
    pub version: u64,
    pub kind: ChangeKind,
}

/// Who is making a change and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeContext {
    pub actor: String,
    pub reason: String,
}

impl ChangeContext {
    pub fn new(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            reason: reason.into(),
        }
    }
}
