//! Rate limit rule definitions.
//!
//! Rules are stored as `json` configuration entries under the configured
//! prefix (default `ratelimit.`), so they are edited, validated, versioned
//! and invalidated like any other entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What a rule counts against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    User,
    Ip,
    Global,
    /// Key built from a template such as `"{user_id}:{route}"`.
    Custom(String),
}

/// Response to a request over the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Block,
    Throttle,
    Queue,
    LogOnly,
}

impl ViolationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Throttle => "throttle",
            Self::Queue => "queue",
            Self::LogOnly => "log_only",
        }
    }
}

/// Identities and roles that bypass a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exemptions {
    pub identities: Vec<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub scope: RateLimitScope,
    pub window_secs: u64,
    pub max_requests: u64,
    pub action: ViolationAction,

    #[serde(default)]
    pub exemptions: Exemptions,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    pub fn new(scope: RateLimitScope, max_requests: u64, window_secs: u64) -> Self {
        Self {
            scope,
            window_secs,
            max_requests,
            action: ViolationAction::Block,
            exemptions: Exemptions::default(),
            enabled: true,
        }
    }

    pub fn with_action(mut self, action: ViolationAction) -> Self {
        self.action = action;
        self
    }

    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// Structural checks beyond what serde enforces.
    pub fn check(&self) -> Result<(), String> {
        if self.window_secs == 0 {
            return Err("window_secs must be greater than zero".to_string());
        }
        if self.max_requests == 0 {
            return Err("max_requests must be greater than zero".to_string());
        }
        if let RateLimitScope::Custom(template) = &self.scope {
            if !template.contains('{') {
                return Err(format!("custom scope '{template}' has no placeholders"));
            }
        }
        Ok(())
    }
}

/// Identity of the caller being limited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitSubject {
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub roles: Vec<String>,
    pub attributes: HashMap<String, String>,
}

impl RateLimitSubject {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Identities checked against the exemption list.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.user_id.iter().chain(self.ip.iter()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_from_json() {
        let rule: RateLimitRule = serde_json::from_value(json!({
            "scope": { "custom": "{user_id}:{route}" },
            "window_secs": 60,
            "max_requests": 5,
            "action": "throttle",
            "exemptions": { "roles": ["admin"] }
        }))
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.action, ViolationAction::Throttle);
        assert_eq!(rule.window_millis(), 60_000);
        assert!(rule.check().is_ok());
    }

    #[test]
    fn test_rule_structural_checks() {
        assert!(RateLimitRule::new(RateLimitScope::User, 0, 60).check().is_err());
        assert!(RateLimitRule::new(RateLimitScope::User, 5, 0).check().is_err());
        assert!(RateLimitRule::new(RateLimitScope::Custom("static".into()), 5, 60)
            .check()
            .is_err());
    }
}
