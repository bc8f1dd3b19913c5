//! Bootstrap configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Value ranges (capacities and TTLs > 0, L1 TTL shorter than L2 TTL)
//! - Environment graph integrity (known parents, no inheritance loops)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Pure function: ControlPlaneConfig → Result<(), Vec<ValidationError>>

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ControlPlaneConfig;

/// One semantic problem in a bootstrap file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("cache.l1_ttl_ms ({l1_ms}) must be shorter than cache.l2_ttl_secs ({l2_secs}s)")]
    L1OutlivesL2 { l1_ms: u64, l2_secs: u64 },

    #[error("cache.l1_ttl_jitter_ms must be shorter than cache.l1_ttl_ms")]
    JitterTooLarge,

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("bus.config_topic and bus.flag_topic must differ")]
    SharedTopic,

    #[error("environment '{0}' is declared more than once")]
    DuplicateEnvironment(String),

    #[error("environment '{0}' reuses the global scope name")]
    GlobalDeclared(String),

    #[error("environment '{name}' has unknown parent '{parent}'")]
    UnknownParent { name: String, parent: String },

    #[error("environment inheritance loop: {}", .0.join(" -> "))]
    InheritanceCycle(Vec<String>),

    #[error("store.url '{0}' is not a valid URL")]
    InvalidStoreUrl(String),

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("observability.log_level '{0}' is not a level")]
    InvalidLogLevel(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ControlPlaneConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let positive: [(&'static str, u64); 9] = [
        ("cache.l1_capacity", config.cache.l1_capacity as u64),
        ("cache.flag_capacity", config.cache.flag_capacity as u64),
        ("cache.l1_ttl_ms", config.cache.l1_ttl_ms),
        ("cache.l2_ttl_secs", config.cache.l2_ttl_secs),
        ("store.call_timeout_ms", config.store.call_timeout_ms),
        ("store.cache_timeout_ms", config.store.cache_timeout_ms),
        ("circuit_breaker.failure_threshold", u64::from(config.circuit_breaker.failure_threshold)),
        ("circuit_breaker.cooldown_ms", config.circuit_breaker.cooldown_ms),
        ("bus.channel_capacity", config.bus.channel_capacity as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }
    if config.rate_limit.queue_capacity == 0 {
        errors.push(ValidationError::Zero {
            field: "rate_limit.queue_capacity",
        });
    }

    let cache = &config.cache;
    if cache.l1_ttl_ms > 0
        && cache.l2_ttl_secs > 0
        && cache.l1_ttl_ms >= cache.l2_ttl_secs.saturating_mul(1000)
    {
        errors.push(ValidationError::L1OutlivesL2 {
            l1_ms: cache.l1_ttl_ms,
            l2_secs: cache.l2_ttl_secs,
        });
    }
    if cache.l1_ttl_ms > 0 && cache.l1_ttl_jitter_ms >= cache.l1_ttl_ms {
        errors.push(ValidationError::JitterTooLarge);
    }

    let required: [(&'static str, &str); 5] = [
        ("bus.config_topic", &config.bus.config_topic),
        ("bus.flag_topic", &config.bus.flag_topic),
        ("environments.global", &config.environments.global),
        ("rate_limit.rule_prefix", &config.rate_limit.rule_prefix),
        ("rate_limit.environment", &config.rate_limit.environment),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            errors.push(ValidationError::Empty { field });
        }
    }
    if config.bus.config_topic == config.bus.flag_topic {
        errors.push(ValidationError::SharedTopic);
    }

    if url::Url::parse(&config.store.url).is_err() {
        errors.push(ValidationError::InvalidStoreUrl(config.store.url.clone()));
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(
            obs.metrics_address.clone(),
        ));
    }
    if obs.log_level.parse::<tracing::Level>().is_err() {
        errors.push(ValidationError::InvalidLogLevel(obs.log_level.clone()));
    }

    validate_environments(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_environments(config: &ControlPlaneConfig, errors: &mut Vec<ValidationError>) {
    let global = &config.environments.global;
    let mut seen = HashSet::new();
    let mut parents: HashMap<&str, Option<&str>> = HashMap::new();

    for env in &config.environments.declared {
        if &env.name == global {
            errors.push(ValidationError::GlobalDeclared(env.name.clone()));
        }
        if !seen.insert(env.name.as_str()) {
            errors.push(ValidationError::DuplicateEnvironment(env.name.clone()));
        }
        parents.insert(env.name.as_str(), env.parent.as_deref());
    }

    for env in &config.environments.declared {
        if let Some(parent) = &env.parent {
            if !parents.contains_key(parent.as_str()) {
                errors.push(ValidationError::UnknownParent {
                    name: env.name.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }

    // Report each loop once, from its lexicographically smallest member.
    let mut reported: HashSet<String> = HashSet::new();
    let mut names: Vec<&str> = parents.keys().copied().collect();
    names.sort_unstable();
    for start in names {
        let mut path = vec![start.to_string()];
        let mut current = start;
        while let Some(Some(parent)) = parents.get(current) {
            if let Some(pos) = path.iter().position(|p| p == parent) {
                let mut cycle: Vec<String> = path[pos..].to_vec();
                let smallest = cycle.iter().min().cloned().unwrap_or_default();
                if reported.insert(smallest) {
                    cycle.push(parent.to_string());
                    errors.push(ValidationError::InheritanceCycle(cycle));
                }
                break;
            }
            path.push(parent.to_string());
            current = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::EnvironmentConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&ControlPlaneConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = ControlPlaneConfig::default();
        config.cache.l1_capacity = 0;
        config.cache.l1_ttl_ms = 600_000;
        config.bus.flag_topic = config.bus.config_topic.clone();
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::Zero {
            field: "cache.l1_capacity"
        }));
        assert!(errors.contains(&ValidationError::L1OutlivesL2 {
            l1_ms: 600_000,
            l2_secs: 300
        }));
        assert!(errors.contains(&ValidationError::SharedTopic));
        assert!(errors.contains(&ValidationError::InvalidLogLevel("loud".into())));
    }

    #[test]
    fn test_environment_graph_checks() {
        let mut config = ControlPlaneConfig::default();
        config.environments.declared = vec![
            EnvironmentConfig::new("staging").with_parent("qa"),
            EnvironmentConfig::new("qa").with_parent("staging"),
            EnvironmentConfig::new("preview").with_parent("missing"),
            EnvironmentConfig::new("preview"),
            EnvironmentConfig::new("global"),
        ];

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateEnvironment("preview".into())));
        assert!(errors.contains(&ValidationError::GlobalDeclared("global".into())));
        assert!(errors.contains(&ValidationError::UnknownParent {
            name: "preview".into(),
            parent: "missing".into()
        }));
        let cycles = errors
            .iter()
            .filter(|e| matches!(e, ValidationError::InheritanceCycle(_)))
            .count();
        assert_eq!(cycles, 1);
    }
}
