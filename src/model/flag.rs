//! Feature flag definitions and evaluation subjects.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A capability toggle with optional targeting and rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Master switch. A disabled flag always serves `default_value`.
    #[serde(default)]
    pub enabled: bool,

    /// Served when disabled, outside the schedule, or as static fallback.
    #[serde(default)]
    pub default_value: bool,

    /// Evaluated in order; the first matching rule decides.
    #[serde(default)]
    pub rules: Vec<TargetingRule>,

    /// Share of subjects (0..=100) enabled when no rule matches.
    #[serde(default)]
    pub rollout_percentage: u8,

    /// Mixed into the bucketing hash. Changing it reshuffles buckets.
    #[serde(default)]
    pub bucketing_seed: String,

    #[serde(default)]
    pub schedule: Option<Schedule>,

    #[serde(default)]
    pub version: u64,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub updated_by: Option<String>,
}

impl FeatureFlag {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: None,
            enabled: false,
            default_value: false,
            rules: Vec::new(),
            rollout_percentage: 0,
            bucketing_seed: String::new(),
            schedule: None,
            version: 0,
            updated_at: Utc::now(),
            updated_by: None,
        }
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn with_rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = percentage;
        self
    }

    pub fn with_rule(mut self, rule: TargetingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Apply a partial change, leaving unspecified fields alone.
    pub fn apply_patch(&mut self, patch: &FlagPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(default_value) = patch.default_value {
            self.default_value = default_value;
        }
        if let Some(pct) = patch.rollout_percentage {
            self.rollout_percentage = pct;
        }
        if let Some(rules) = &patch.rules {
            self.rules = rules.clone();
        }
        if let Some(schedule) = &patch.schedule {
            self.schedule = Some(schedule.clone());
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
    }

    /// Serialized definition without bookkeeping fields, used for diffs.
    pub fn definition_json(&self) -> Value {
        serde_json::json!({
            "enabled": self.enabled,
            "default_value": self.default_value,
            "rollout_percentage": self.rollout_percentage,
            "bucketing_seed": self.bucketing_seed,
            "rules": self.rules,
            "schedule": self.schedule,
        })
    }
}

/// Partial flag definition carried by templates and bulk writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagPatch {
    pub enabled: Option<bool>,
    pub default_value: Option<bool>,
    pub rollout_percentage: Option<u8>,
    pub rules: Option<Vec<TargetingRule>>,
    pub schedule: Option<Schedule>,
    pub description: Option<String>,
}

impl FlagPatch {
    pub fn enable() -> Self {
        Self {
            enabled: Some(true),
            ..Self::default()
        }
    }
}

/// Activation window. Either bound may be open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.starts_at.map_or(true, |s| at >= s) && self.ends_at.map_or(true, |e| at < e)
    }
}

/// Condition plus the value served when it matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingRule {
    #[serde(default)]
    pub name: Option<String>,

    pub condition: Condition,

    #[serde(default = "default_serve")]
    pub serve: bool,
}

fn default_serve() -> bool {
    true
}

impl TargetingRule {
    pub fn serve_true(condition: Condition) -> Self {
        Self {
            name: None,
            condition,
            serve: true,
        }
    }
}

/// Predicate tree over subject attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Match {
        attribute: Attribute,
        operator: Operator,
        value: Value,
    },
    /// AND: stops at the first false operand.
    All(Vec<Condition>),
    /// OR: stops at the first true operand.
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn matches(attribute: Attribute, operator: Operator, value: Value) -> Self {
        Self::Match {
            attribute,
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    UserId,
    Role,
    Environment,
    Country,
    Region,
    Device,
    AppVersion,
    /// Evaluation time.
    Now,
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    OneOf,
    NotOneOf,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

/// Attributes of the subject a flag is evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectContext {
    /// Stable identity used for bucketing.
    pub subject_id: String,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub environment: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub device: Option<String>,
    pub app_version: Option<String>,
    /// Overrides the clock, for previews.
    pub now: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, Value>,
}

impl SubjectContext {
    pub fn for_subject(subject_id: impl Into<String>) -> Self {
        let subject_id = subject_id.into();
        Self {
            user_id: Some(subject_id.clone()),
            subject_id,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}
