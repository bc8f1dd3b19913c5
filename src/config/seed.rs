//! Seed definitions file.
//!
//! Declares entries, overrides, flags and templates that the process creates
//! at start-up through the normal validated write path. Definitions that
//! already exist are left alone, so restarting with the same seed is a no-op.
//!
//! ```toml
//! [[entries]]
//! key = "checkout.maxRetries"
//! data_type = "number"
//! value = 3
//! category = "checkout"
//! validation = { min = 0, max = 10 }
//!
//! [[overrides]]
//! key = "checkout.maxRetries"
//! environment = "staging"
//! value = 5
//!
//! [[flags]]
//! key = "newCheckoutFlow.enabled"
//! enabled = true
//! rollout_percentage = 25
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ConfigurationEntry, ConfigurationTemplate, FeatureFlag};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SeedFile {
    pub entries: Vec<ConfigurationEntry>,
    pub overrides: Vec<SeedOverride>,
    pub flags: Vec<FeatureFlag>,
    pub templates: Vec<ConfigurationTemplate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SeedOverride {
    pub key: String,
    pub environment: String,
    pub value: Value,
}

impl SeedFile {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.overrides.is_empty()
            && self.flags.is_empty()
            && self.templates.is_empty()
    }
}
