//! Feature flag evaluation.
//!
//! # Responsibilities
//! - Decide a flag for one subject: master switch, schedule, targeting
//!   rules, then percentage rollout
//! - Never fail the caller: store trouble degrades to a cached definition,
//!   then to the bootstrap default, then to `false`
//!
//! # Data Flow
//! ```text
//! evaluate(flag, subject)
//!     → L1 definition (fresh)
//!     → circuit breaker → L2 → store
//!     → on failure or open circuit: expired L1 definition (stale)
//!       → static default → false
//!     → disabled? outside schedule? first matching rule? bucket < rollout?
//! ```
//!
//! # Design Decisions
//! - The breaker belongs to the evaluator instance, not to the process
//! - Definitions are cached, not results, so targeting sees the subject
//!   being evaluated even when serving stale data

pub mod bucketing;
pub mod targeting;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::cache::LocalCache;
use crate::model::{FeatureFlag, SubjectContext};
use crate::observability::metrics;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::service::ConfigurationService;

/// Why an evaluation returned what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    Disabled,
    OutsideSchedule,
    RuleMatch,
    Rollout,
    UnknownFlag,
    /// No definition could be obtained; static default served.
    Fallback,
}

impl EvaluationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::OutsideSchedule => "outside_schedule",
            Self::RuleMatch => "rule_match",
            Self::Rollout => "rollout",
            Self::UnknownFlag => "unknown_flag",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagEvaluation {
    pub key: String,
    pub value: bool,
    pub reason: EvaluationReason,
    /// Name or position of the matching rule.
    pub rule: Option<String>,
    /// Rollout bucket, when the rollout decided.
    pub bucket: Option<u8>,
    /// Decided from a definition the store could not confirm.
    pub stale: bool,
}

enum Lookup {
    Fresh(Arc<FeatureFlag>),
    Stale(Arc<FeatureFlag>),
    Missing,
    Unavailable,
}

/// Per-process flag evaluator with its own circuit breaker.
#[derive(Debug)]
pub struct FlagEvaluator {
    service: Arc<ConfigurationService>,
    definitions: Arc<LocalCache<String, FeatureFlag>>,
    breaker: CircuitBreaker,
    static_defaults: BTreeMap<String, bool>,
}

impl FlagEvaluator {
    pub fn new(service: Arc<ConfigurationService>) -> Self {
        let config = service.config();
        let breaker = CircuitBreaker::new(
            "flag_store",
            &config.circuit_breaker,
            service.clock().clone(),
        );
        Self {
            static_defaults: config.flags.static_defaults.clone(),
            definitions: service.flag_cache(),
            breaker,
            service,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Decide `key` for `subject`. Infallible by contract.
    pub async fn evaluate(&self, key: &str, subject: &SubjectContext) -> FlagEvaluation {
        let evaluation = match self.lookup(key).await {
            Lookup::Fresh(flag) => self.decide(&flag, subject, false),
            Lookup::Stale(flag) => self.decide(&flag, subject, true),
            Lookup::Missing => FlagEvaluation {
                key: key.to_string(),
                value: self.static_default(key),
                reason: EvaluationReason::UnknownFlag,
                rule: None,
                bucket: None,
                stale: false,
            },
            Lookup::Unavailable => FlagEvaluation {
                key: key.to_string(),
                value: self.static_default(key),
                reason: EvaluationReason::Fallback,
                rule: None,
                bucket: None,
                stale: true,
            },
        };
        metrics::record_flag_evaluation(evaluation.reason.as_str());
        tracing::trace!(
            flag = key,
            subject = %subject.subject_id,
            value = evaluation.value,
            reason = evaluation.reason.as_str(),
            stale = evaluation.stale,
            "Flag evaluated"
        );
        evaluation
    }

    pub async fn is_enabled(&self, key: &str, subject: &SubjectContext) -> bool {
        self.evaluate(key, subject).await.value
    }

    /// Decide a known definition without touching the store.
    pub fn decide(&self, flag: &FeatureFlag, subject: &SubjectContext, stale: bool) -> FlagEvaluation {
        let now = subject.now.unwrap_or_else(|| self.service.clock().now());
        let result = |value: bool,
                      reason: EvaluationReason,
                      rule: Option<String>,
                      bucket: Option<u8>| FlagEvaluation {
            key: flag.key.clone(),
            value,
            reason,
            rule,
            bucket,
            stale,
        };

        if !flag.enabled {
            return result(flag.default_value, EvaluationReason::Disabled, None, None);
        }
        if let Some(schedule) = &flag.schedule {
            if !schedule.contains(now) {
                return result(flag.default_value, EvaluationReason::OutsideSchedule, None, None);
            }
        }

        let regexes = self.service.validator().regexes();
        for (position, rule) in flag.rules.iter().enumerate() {
            if targeting::matches(&rule.condition, subject, now, regexes) {
                let name = rule.name.clone().unwrap_or_else(|| format!("#{position}"));
                return result(rule.serve, EvaluationReason::RuleMatch, Some(name), None);
            }
        }

        let bucket = bucketing::bucket(&flag.bucketing_seed, &subject.subject_id, &flag.key);
        result(
            bucketing::in_rollout(bucket, flag.rollout_percentage),
            EvaluationReason::Rollout,
            None,
            Some(bucket),
        )
    }

    async fn lookup(&self, key: &str) -> Lookup {
        let cache_key = key.to_string();
        if let Some(flag) = self.definitions.get(&cache_key) {
            return Lookup::Fresh(flag);
        }

        let fetched = self.breaker.call(|| self.service.fetch_flag(key)).await;
        match fetched {
            Ok(Some(flag)) => Lookup::Fresh(Arc::new(flag)),
            Ok(None) => Lookup::Missing,
            Err(e) => {
                tracing::debug!(flag = key, error = %e, "Flag store unavailable, falling back");
                match self.definitions.get_stale(&cache_key) {
                    Some(flag) => Lookup::Stale(flag),
                    None => Lookup::Unavailable,
                }
            }
        }
    }

    fn static_default(&self, key: &str) -> bool {
        self.static_defaults.get(key).copied().unwrap_or(false)
    }
}
