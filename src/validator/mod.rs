//! Validator and dependency graph.
//!
//! # Data Flow
//! ```text
//! raw JSON value
//!     → ConfigValue::coerce (type constraint)
//!     → range / length / pattern / allowed values / custom predicate
//!     → graph.rs (cycles, required dependencies, conflicts)
//!     → accepted for the store write
//! ```
//!
//! # Design Decisions
//! - Pure: no I/O; the service loads the graph view before calling in
//! - Reports every violated rule, not just the first
//! - Compiled patterns are cached by source string

pub mod graph;
pub mod predicates;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::error::ControlPlaneError;
use crate::model::{ConfigValue, ConfigurationEntry, DataType, ValidationRule};

pub use graph::DependencyView;

/// A single failed constraint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleViolation {
    #[error("expected {expected}, got {found}")]
    TypeMismatch {
        expected: DataType,
        found: &'static str,
    },

    #[error("value is below minimum {min}")]
    BelowMinimum { min: f64 },

    #[error("value exceeds maximum {max}")]
    AboveMaximum { max: f64 },

    #[error("length is below minimum {min}")]
    TooShort { min: usize },

    #[error("length exceeds maximum {max}")]
    TooLong { max: usize },

    #[error("value does not match pattern '{pattern}'")]
    PatternMismatch { pattern: String },

    #[error("pattern '{pattern}' is invalid: {error}")]
    InvalidPattern { pattern: String, error: String },

    #[error("value is not one of {allowed}")]
    NotAllowed { allowed: String },

    #[error("custom rule '{name}' failed: {message}")]
    Custom { name: String, message: String },

    #[error("custom rule '{0}' is not registered")]
    UnknownPredicate(String),
}

/// Named custom check on a typed value.
pub type Predicate = Arc<dyn Fn(&ConfigValue) -> Result<(), String> + Send + Sync>;

/// Compiled regular expressions keyed by their source.
#[derive(Debug, Clone, Default)]
pub struct RegexCache {
    compiled: Arc<DashMap<String, Regex>>,
}

impl RegexCache {
    const MAX_PATTERNS: usize = 1024;

    pub fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.value().clone());
        }
        let re = Regex::new(pattern)?;
        if self.compiled.len() >= Self::MAX_PATTERNS {
            self.compiled.clear();
        }
        self.compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

/// Synchronous rule checker.
#[derive(Clone)]
pub struct Validator {
    predicates: HashMap<String, Predicate>,
    regexes: RegexCache,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("Validator").field("predicates", &names).finish()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    /// Validator with the built-in predicates registered.
    pub fn new() -> Self {
        Self {
            predicates: predicates::builtin(),
            regexes: RegexCache::default(),
        }
    }

    /// Register (or replace) a custom predicate.
    pub fn with_predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ConfigValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    pub fn regexes(&self) -> &RegexCache {
        &self.regexes
    }

    /// Coerce `raw` to the entry's type and check every rule.
    pub fn validate(
        &self,
        entry: &ConfigurationEntry,
        raw: &Value,
    ) -> Result<ConfigValue, ControlPlaneError> {
        let value = ConfigValue::coerce(raw, entry.data_type).map_err(|m| {
            ControlPlaneError::Validation {
                key: entry.key.clone(),
                violations: vec![RuleViolation::TypeMismatch {
                    expected: m.expected,
                    found: m.found,
                }],
            }
        })?;

        let violations = self.check_value(&entry.validation, &value);
        if violations.is_empty() {
            Ok(value)
        } else {
            Err(ControlPlaneError::Validation {
                key: entry.key.clone(),
                violations,
            })
        }
    }

    /// Check an already-typed value against a rule set.
    pub fn check_value(&self, rule: &ValidationRule, value: &ConfigValue) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        if let Some(n) = value.as_f64() {
            if let Some(min) = rule.min {
                if n < min {
                    violations.push(RuleViolation::BelowMinimum { min });
                }
            }
            if let Some(max) = rule.max {
                if n > max {
                    violations.push(RuleViolation::AboveMaximum { max });
                }
            }
        }

        if let Some(len) = value.length() {
            if let Some(min) = rule.min_length {
                if len < min {
                    violations.push(RuleViolation::TooShort { min });
                }
            }
            if let Some(max) = rule.max_length {
                if len > max {
                    violations.push(RuleViolation::TooLong { max });
                }
            }
        }

        if let (Some(pattern), Some(s)) = (&rule.pattern, value.as_str()) {
            match self.regexes.get_or_compile(pattern) {
                Ok(re) if !re.is_match(s) => violations.push(RuleViolation::PatternMismatch {
                    pattern: pattern.clone(),
                }),
                Ok(_) => {}
                Err(e) => violations.push(RuleViolation::InvalidPattern {
                    pattern: pattern.clone(),
                    error: e.to_string(),
                }),
            }
        }

        if let Some(allowed) = &rule.allowed_values {
            if !allowed.iter().any(|a| value.matches_json(a)) {
                violations.push(RuleViolation::NotAllowed {
                    allowed: Value::Array(allowed.clone()).to_string(),
                });
            }
        }

        if let Some(name) = &rule.custom {
            match self.predicates.get(name) {
                Some(predicate) => {
                    if let Err(message) = predicate(value) {
                        violations.push(RuleViolation::Custom {
                            name: name.clone(),
                            message,
                        });
                    }
                }
                None => violations.push(RuleViolation::UnknownPredicate(name.clone())),
            }
        }

        violations
    }
}
