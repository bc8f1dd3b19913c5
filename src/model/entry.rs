//! Configuration entries, environment overrides and their validation rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::value::{ConfigValue, DataType};

/// A single named configuration value and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub key: String,

    /// Global value. `None` falls back to `default_value`.
    #[serde(default)]
    pub value: Option<Value>,

    #[serde(default)]
    pub default_value: Option<Value>,

    pub data_type: DataType,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub subcategory: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Changing the value only takes effect after consumers restart.
    #[serde(default)]
    pub requires_restart: bool,

    /// Value is never written to logs.
    #[serde(default)]
    pub is_sensitive: bool,

    #[serde(default)]
    pub validation: ValidationRule,

    /// Incremented by exactly one per successful write to this key.
    #[serde(default)]
    pub version: u64,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub updated_by: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ConfigurationEntry {
    /// Minimal entry with no value, for builders and tests.
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        Self {
            key: key.into(),
            value: None,
            default_value: None,
            data_type,
            category: String::new(),
            subcategory: None,
            description: None,
            is_active: true,
            requires_restart: false,
            is_sensitive: false,
            validation: ValidationRule::default(),
            version: 0,
            updated_at: Utc::now(),
            updated_by: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validation = rule;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.is_sensitive = true;
        self
    }
}

/// Environment-specific replacement value for an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentOverride {
    pub key: String,
    pub environment: String,
    pub value: Value,

    /// Entry version produced by the write that last touched this override.
    pub version: u64,

    #[serde(default = "default_true")]
    pub is_active: bool,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub updated_by: Option<String>,
}

/// Constraints attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRule {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub allowed_values: Option<Vec<Value>>,

    /// Name of a registered predicate.
    pub custom: Option<String>,

    pub depends_on: Vec<Dependency>,
    pub conflicts_with: Vec<ConflictRule>,
}

impl ValidationRule {
    pub fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            ..Self::default()
        }
    }

    /// Whether a dependency or conflict rule names `key`.
    pub fn references(&self, key: &str) -> bool {
        self.depends_on.iter().any(|d| d.key == key)
            || self.conflicts_with.iter().any(|c| c.key == key)
    }
}

/// This entry needs another key to be set (and optionally to hold a value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub key: String,

    /// Edge is only active while this entry's own value satisfies `when`.
    #[serde(default)]
    pub when: Option<ValueCondition>,

    /// Condition the dependency's current value must satisfy.
    #[serde(default)]
    pub requires: Option<ValueCondition>,
}

impl Dependency {
    pub fn on(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            when: None,
            requires: None,
        }
    }

    pub fn is_active_for(&self, own: &ConfigValue) -> bool {
        self.when.as_ref().map_or(true, |c| c.holds(own))
    }
}

/// This entry must not hold `when` while `key` holds `other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRule {
    pub key: String,

    #[serde(default)]
    pub when: Option<ValueCondition>,

    pub other: ValueCondition,
}

/// Predicate over a typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum ValueCondition {
    Equals(Value),
    NotEquals(Value),
    OneOf(Vec<Value>),
    Truthy,
}

impl ValueCondition {
    pub fn holds(&self, value: &ConfigValue) -> bool {
        match self {
            Self::Equals(expected) => value.matches_json(expected),
            Self::NotEquals(expected) => !value.matches_json(expected),
            Self::OneOf(options) => options.iter().any(|o| value.matches_json(o)),
            Self::Truthy => value.is_truthy(),
        }
    }
}

impl std::fmt::Display for ValueCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals(v) => write!(f, "equal to {v}"),
            Self::NotEquals(v) => write!(f, "not equal to {v}"),
            Self::OneOf(vs) => write!(f, "one of {}", Value::Array(vs.clone())),
            Self::Truthy => write!(f, "truthy"),
        }
    }
}
