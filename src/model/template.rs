//! Named bundles of configuration and flag changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::flag::FlagPatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationTemplate {
    /// Stable identifier, e.g. `black-friday-2024`.
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Restricts the template to one environment when set.
    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub values: BTreeMap<String, Value>,

    #[serde(default)]
    pub flags: BTreeMap<String, FlagPatch>,

    /// Bumped on every definition change; usage updates leave it alone.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub usage: TemplateUsage,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ConfigurationTemplate {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            environment: None,
            values: BTreeMap::new(),
            flags: BTreeMap::new(),
            version: 0,
            usage: TemplateUsage::default(),
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>, patch: FlagPatch) -> Self {
        self.flags.insert(key.into(), patch);
        self
    }

    pub fn scoped_to(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.flags.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateUsage {
    pub count: u64,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub last_applied_version: Option<u64>,
}

impl TemplateUsage {
    pub fn record(&mut self, at: DateTime<Utc>, version: u64) {
        self.count += 1;
        if self.last_applied_at.map_or(true, |last| at >= last) {
            self.last_applied_at = Some(at);
            self.last_applied_version = Some(version);
        }
    }
}
