//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate bootstrap configuration
//! - Wire collaborators into one [`ConfigurationService`]
//! - Build the evaluator, limiter, rollback and template engines on top
//! - Subscribe L1 caches and queued rate-limit waiters to the bus
//! - Apply the seed file through the validated write path
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Seeding skips definitions that already exist, so restarts are no-ops

use std::sync::Arc;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::cache::{BroadcastBus, DistributedCache, InvalidationBus, MemoryDistributedCache, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config, BootstrapError, ControlPlaneConfig, SeedFile};
use crate::error::ControlPlaneError;
use crate::flags::FlagEvaluator;
use crate::history::RollbackEngine;
use crate::model::ChangeContext;
use crate::ratelimit::RateLimiter;
use crate::service::{Collaborators, ConfigurationService};
use crate::store::{ConfigStore, MemoryStore};
use crate::templates::TemplateEngine;
use crate::validator::Validator;

const DEFAULT_SEED_ACTOR: &str = "seed";

/// Counts from one seed application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

/// Every subsystem of one running control plane instance.
#[derive(Debug)]
pub struct ControlPlane {
    pub config: Arc<ControlPlaneConfig>,
    pub service: Arc<ConfigurationService>,
    pub flags: FlagEvaluator,
    pub rate_limiter: RateLimiter,
    pub rollback: RollbackEngine,
    pub templates: TemplateEngine,
    subscriptions: Vec<Subscription>,
}

impl ControlPlane {
    pub fn builder(config: ControlPlaneConfig) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(config)
    }

    /// Number of live bus subscriptions held by this instance.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Create every definition in `seed` that does not exist yet.
    ///
    /// Entries go first so overrides, flags and templates referring to
    /// them validate against stored definitions.
    pub async fn apply_seed(&self, seed: &SeedFile) -> Result<SeedReport, BootstrapError> {
        let actor = self
            .config
            .seed
            .actor
            .clone()
            .unwrap_or_else(|| DEFAULT_SEED_ACTOR.to_string());
        let ctx = ChangeContext::new(actor, "seed");
        let mut report = SeedReport::default();

        for entry in &seed.entries {
            let exists = self
                .service
                .load_entry(&entry.key)
                .await
                .map_err(|e| rejected(&entry.key, e))?
                .is_some();
            if exists {
                report.skipped += 1;
                continue;
            }
            self.service
                .create_entry(entry.clone(), &ctx)
                .await
                .map_err(|e| rejected(&entry.key, e))?;
            report.created += 1;
        }

        for o in &seed.overrides {
            let exists = self
                .service
                .load_override(&o.key, &o.environment)
                .await
                .map_err(|e| rejected(&o.key, e))?
                .is_some();
            if exists {
                report.skipped += 1;
                continue;
            }
            self.service
                .set(&o.key, o.value.clone(), &o.environment, &ctx)
                .await
                .map_err(|e| rejected(&o.key, e))?;
            report.created += 1;
        }

        for flag in &seed.flags {
            let exists = self
                .service
                .load_flag(&flag.key)
                .await
                .map_err(|e| rejected(&flag.key, e))?
                .is_some();
            if exists {
                report.skipped += 1;
                continue;
            }
            self.service
                .create_flag(flag.clone(), &ctx)
                .await
                .map_err(|e| rejected(&flag.key, e))?;
            report.created += 1;
        }

        for template in &seed.templates {
            match self.templates.get_template(&template.id).await {
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(ControlPlaneError::NotFound { .. }) => {}
                Err(e) => return Err(rejected(&template.id, e)),
            }
            self.templates
                .save_template(template.clone(), &ctx)
                .await
                .map_err(|e| rejected(&template.id, e))?;
            report.created += 1;
        }

        tracing::info!(created = report.created, skipped = report.skipped, "Seed applied");
        Ok(report)
    }
}

fn rejected(key: &str, e: ControlPlaneError) -> BootstrapError {
    BootstrapError::Seed {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

/// Assembles a [`ControlPlane`]. Collaborators left unset get the
/// in-process implementations.
#[derive(Debug)]
pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    validator: Validator,
    store: Option<Arc<dyn ConfigStore>>,
    l2: Option<Arc<dyn DistributedCache>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ControlPlaneBuilder {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            config,
            validator: Validator::new(),
            store: None,
            l2: None,
            bus: None,
            audit: None,
            clock: None,
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_distributed_cache(mut self, l2: Arc<dyn DistributedCache>) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate, wire and subscribe. Must run inside a Tokio runtime.
    pub fn build(self) -> Result<ControlPlane, BootstrapError> {
        validate_config(&self.config).map_err(BootstrapError::Validation)?;

        let store = match self.store {
            Some(store) => store,
            None if self.config.store.url.starts_with("memory://") => Arc::new(MemoryStore::new()),
            None => {
                return Err(BootstrapError::Startup {
                    component: "store",
                    reason: format!("no backend registered for '{}'", self.config.store.url),
                })
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let capacity = self.config.bus.channel_capacity;
        let deps = Collaborators {
            store,
            l2: self
                .l2
                .unwrap_or_else(|| Arc::new(MemoryDistributedCache::new(clock.clone()))),
            bus: self.bus.unwrap_or_else(|| Arc::new(BroadcastBus::new(capacity))),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            clock,
        };

        let config = Arc::new(self.config);
        let service = Arc::new(ConfigurationService::new(config.clone(), deps, self.validator));
        tracing::debug!(environments = ?service.environments(), "Configuration service ready");

        let flags = FlagEvaluator::new(service.clone());
        let rate_limiter = RateLimiter::new(service.clone());
        let rollback = RollbackEngine::new(service.clone());
        let templates = TemplateEngine::new(service.clone());

        let mut subscriptions = service.subscribe_invalidations().map_err(|e| {
            BootstrapError::Startup {
                component: "invalidation bus",
                reason: e.to_string(),
            }
        })?;
        subscriptions.push(rate_limiter.subscribe_rule_changes().map_err(|e| {
            BootstrapError::Startup {
                component: "rate limiter",
                reason: e.to_string(),
            }
        })?);

        tracing::info!(
            store = %config.store.url,
            subscriptions = subscriptions.len(),
            "Control plane started"
        );
        Ok(ControlPlane {
            config,
            service,
            flags,
            rate_limiter,
            rollback,
            templates,
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeedOverride;
    use crate::model::{ConfigurationEntry, DataType, FeatureFlag, ValidationRule};
    use serde_json::json;

    fn seed() -> SeedFile {
        SeedFile {
            entries: vec![ConfigurationEntry::new("checkout.maxRetries", DataType::Number)
                .with_value(json!(3))
                .with_validation(ValidationRule::range(0.0, 10.0))],
            overrides: vec![SeedOverride {
                key: "checkout.maxRetries".into(),
                environment: "staging".into(),
                value: json!(5),
            }],
            flags: vec![FeatureFlag::new("newCheckoutFlow").enabled()],
            templates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let plane = ControlPlane::builder(ControlPlaneConfig::default())
            .build()
            .unwrap();
        assert_eq!(plane.subscription_count(), 3);

        let first = plane.apply_seed(&seed()).await.unwrap();
        assert_eq!(first, SeedReport { created: 3, skipped: 0 });
        let again = plane.apply_seed(&seed()).await.unwrap();
        assert_eq!(again, SeedReport { created: 0, skipped: 3 });

        let staging = plane.service.get("checkout.maxRetries", "staging").await.unwrap();
        assert_eq!(staging.value.as_f64(), Some(5.0));
    }

    #[tokio::test]
    async fn test_invalid_seed_names_the_key() {
        let plane = ControlPlane::builder(ControlPlaneConfig::default())
            .build()
            .unwrap();
        let mut bad = seed();
        bad.overrides[0].value = json!(15);
        match plane.apply_seed(&bad).await {
            Err(BootstrapError::Seed { key, .. }) => assert_eq!(key, "checkout.maxRetries"),
            other => panic!("expected seed error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_store_url_is_fatal() {
        let mut config = ControlPlaneConfig::default();
        config.store.url = "postgres://db/config".into();
        assert!(matches!(
            ControlPlane::builder(config).build(),
            Err(BootstrapError::Startup { component: "store", .. })
        ));
    }
}
