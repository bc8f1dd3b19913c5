//! Caller-facing error taxonomy.
//!
//! # Propagation
//! - `Validation`, `Cycle`, `DependencyConflict`, `InvalidRequest`: rejected
//!   before any store mutation, not retryable without changing the request
//! - `Conflict`, `StoreUnavailable`: retryable (re-read, then retry)
//! - `CircuitOpen`: absorbed by the flag evaluator, never returned from it
//! - `NotFound`: surfaced as-is, not retried

use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;
use crate::validator::RuleViolation;

/// Kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Configuration,
    Flag,
    Template,
    RateLimitRule,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration entry"),
            Self::Flag => write!(f, "feature flag"),
            Self::Template => write!(f, "template"),
            Self::RateLimitRule => write!(f, "rate limit rule"),
        }
    }
}

/// Errors returned by control plane operations.
#[derive(Debug, Clone, Error)]
pub enum ControlPlaneError {
    /// Unknown key, flag or template, and no default available.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: EntityKind, key: String },

    /// Type, range, pattern or enumeration failure.
    #[error("validation failed for '{key}': {}", join_violations(.violations))]
    Validation {
        key: String,
        violations: Vec<RuleViolation>,
    },

    /// The write would close a loop in the dependency graph.
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A declared dependency or conflict rule rejects the write.
    #[error("'{key}' incompatible with '{other}': {reason}")]
    DependencyConflict {
        key: String,
        other: String,
        reason: String,
    },

    /// Optimistic concurrency check failed.
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Persistence timed out or is down.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Flag store circuit breaker is open.
    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlPlaneError {
    pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Returns true if the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::StoreUnavailable(_) | Self::CircuitOpen(_)
        )
    }

    /// Short static label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Validation { .. } => "validation",
            Self::Cycle { .. } => "cycle",
            Self::DependencyConflict { .. } => "dependency_conflict",
            Self::Conflict { .. } => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::CircuitOpen(_) => "circuit_open",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<StoreError> for ControlPlaneError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionMismatch {
                key,
                expected,
                actual,
            } => Self::Conflict {
                key,
                expected,
                actual,
            },
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<CacheError> for ControlPlaneError {
    fn from(err: CacheError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

fn join_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for control plane operations.
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ControlPlaneError::Conflict {
            key: "a".into(),
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(ControlPlaneError::StoreUnavailable("down".into()).is_retryable());
        assert!(!ControlPlaneError::not_found(EntityKind::Flag, "x").is_retryable());
        assert!(!ControlPlaneError::Cycle { path: vec![] }.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ControlPlaneError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");

        let err = ControlPlaneError::Validation {
            key: "checkout.maxRetries".into(),
            violations: vec![RuleViolation::AboveMaximum { max: 10.0 }],
        };
        assert!(err.to_string().contains("checkout.maxRetries"));
        assert!(err.to_string().contains("10"));
    }
}
