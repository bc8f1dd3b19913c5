//! Configuration service.
//!
//! # Responsibilities
//! - Resolve effective values per environment (read.rs)
//! - Validated, version-checked writes with history and audit (write.rs)
//! - Batched writes under a caller-selected failure policy (bulk.rs)
//! - Feature flag definitions through the same write path (flags.rs)
//! - Keep both cache tiers honest after every write
//!
//! # Data Flow
//! ```text
//! get:  L1 → L2 → store (override chain → global → default)
//!       → fill L2 → fill L1
//!       store down: resident expired L1 copy, marked stale
//!
//! set:  load entry → Validator → DependencyView checks
//!       → store commit (entry version precondition + ChangeRecord)
//!       → drop own L1, delete L2 keys, publish invalidation, audit
//! ```
//!
//! # Design Decisions
//! - One service per process owns its caches; nothing is global
//! - Every write to a key, global or override, bumps the entry version by
//!   exactly one, so writers to the same key always serialize
//! - The writer drops its own L1 before publishing, so read-after-write
//!   holds on the writing instance even if the bus is down
//! - A store read that overlaps a write committed by this instance is
//!   returned but not cached in either tier. Overlap with a peer's write
//!   is bounded by the L2 TTL

mod bulk;
mod environment;
mod flags;
mod read;
mod write;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::cache::{
    BusError, BusEvent, CacheKey, DistributedCache, InvalidationBus, InvalidationHandler,
    LocalCache, Subscription,
};
use crate::clock::Clock;
use crate::config::ControlPlaneConfig;
use crate::error::ControlPlaneResult;
use crate::model::{ChangeRecord, ConfigValue, FeatureFlag, HistoryKey};
use crate::observability::metrics;
use crate::resilience::timeouts;
use crate::store::ConfigStore;
use crate::validator::Validator;

pub use bulk::{BulkItem, BulkReport, ItemOutcome, PartialFailurePolicy};
pub(crate) use bulk::PlannedItem;
pub use environment::EnvironmentHierarchy;
pub use read::EntryDetails;

/// External collaborators, injected at construction.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ConfigStore>,
    pub l2: Arc<dyn DistributedCache>,
    pub bus: Arc<dyn InvalidationBus>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

/// Where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ValueSource {
    Override { environment: String },
    Global,
    Default,
}

/// Effective value of a key in one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved {
    pub key: String,
    pub environment: String,
    pub value: ConfigValue,
    pub source: ValueSource,
    /// Entry version the value was resolved at.
    pub version: u64,
    pub is_sensitive: bool,
    pub requires_restart: bool,
    /// Served from an expired local copy while the store was unreachable.
    #[serde(skip)]
    pub stale: bool,
}

/// Result of one successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub key: String,
    /// `None` for flag definitions.
    pub environment: Option<String>,
    pub version: u64,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub change_id: Uuid,
}

/// Orchestrates validation, storage, history and both cache tiers.
pub struct ConfigurationService {
    config: Arc<ControlPlaneConfig>,
    deps: Collaborators,
    validator: Validator,
    environments: EnvironmentHierarchy,
    values: Arc<LocalCache<CacheKey, Resolved>>,
    flags: Arc<LocalCache<String, FeatureFlag>>,
    /// Bumped for every configuration write this instance commits.
    write_epoch: AtomicU64,
}

impl std::fmt::Debug for ConfigurationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationService")
            .field("environments", &self.environments)
            .field("values", &self.values)
            .field("flags", &self.flags)
            .finish()
    }
}

impl ConfigurationService {
    pub fn new(config: Arc<ControlPlaneConfig>, deps: Collaborators, validator: Validator) -> Self {
        let cache = &config.cache;
        let ttl = i64::try_from(cache.l1_ttl_ms).unwrap_or(i64::MAX);
        let jitter = i64::try_from(cache.l1_ttl_jitter_ms).unwrap_or(0);
        let values = Arc::new(LocalCache::new(
            "l1_values",
            cache.l1_capacity,
            ttl,
            jitter,
            deps.clock.clone(),
        ));
        let flags = Arc::new(LocalCache::new(
            "l1_flags",
            cache.flag_capacity,
            ttl,
            jitter,
            deps.clock.clone(),
        ));
        Self {
            environments: EnvironmentHierarchy::from_config(&config.environments),
            config,
            deps,
            validator,
            values,
            flags,
            write_epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn environments(&self) -> &EnvironmentHierarchy {
        &self.environments
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.deps.clock
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.deps
    }

    pub(crate) fn audit(&self) -> &dyn AuditSink {
        self.deps.audit.as_ref()
    }

    /// Flag definition L1, shared with the evaluator.
    pub fn flag_cache(&self) -> Arc<LocalCache<String, FeatureFlag>> {
        self.flags.clone()
    }

    /// Subscribe this instance's L1 caches to fleet invalidations.
    pub fn subscribe_invalidations(&self) -> Result<Vec<Subscription>, BusError> {
        let values = self.values.clone();
        let environments = self.environments.clone();
        let config_topic = self.config.bus.config_topic.clone();
        let on_config: InvalidationHandler = Arc::new(move |event| {
            metrics::record_invalidation(&config_topic, "received");
            match event {
                BusEvent::Invalidate(msg) => {
                    drop_local(&values, &environments, &msg.key, &msg.environment);
                }
                BusEvent::Overflow { .. } => values.clear(),
            }
        });

        let flags = self.flags.clone();
        let flag_topic = self.config.bus.flag_topic.clone();
        let on_flag: InvalidationHandler = Arc::new(move |event| {
            metrics::record_invalidation(&flag_topic, "received");
            match event {
                BusEvent::Invalidate(msg) => {
                    flags.invalidate(&msg.key);
                }
                BusEvent::Overflow { .. } => flags.clear(),
            }
        });

        Ok(vec![
            self.deps.bus.subscribe(&self.config.bus.config_topic, on_config)?,
            self.deps.bus.subscribe(&self.config.bus.flag_topic, on_flag)?,
        ])
    }

    /// Change ledger of one target, newest first.
    pub async fn history(
        &self,
        target: &HistoryKey,
        limit: usize,
    ) -> ControlPlaneResult<Vec<ChangeRecord>> {
        Ok(timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.load_history(target, limit),
        )
        .await?)
    }

    /// Publish an invalidation, logging instead of failing: the write it
    /// describes is already durable and L1 TTL bounds the damage.
    async fn publish(&self, topic: &str, key: &str, environment: &str) {
        let message = crate::cache::InvalidationMessage::new(key, environment);
        let published = timeouts::bus_call(
            self.config.bus.publish_timeout(),
            topic,
            self.deps.bus.publish(topic, message),
        )
        .await;
        match published {
            Ok(()) => metrics::record_invalidation(topic, "published"),
            Err(e) => {
                metrics::record_invalidation(topic, "failed");
                tracing::warn!(topic, key, environment, error = %e, "Invalidation publish failed");
            }
        }
    }

    async fn delete_l2(&self, keys: Vec<String>) {
        let deleted = timeouts::cache_call(
            self.config.store.cache_timeout(),
            self.deps.l2.delete(&keys),
        )
        .await;
        if let Err(e) = deleted {
            tracing::warn!(keys = ?keys, error = %e, "L2 delete failed; entries expire by TTL");
        }
    }

    /// Drop every cached resolution a write at `environment` can change,
    /// locally and in L2, then tell the fleet.
    async fn propagate_config(&self, key: &str, environment: &str) {
        self.write_epoch.fetch_add(1, Ordering::SeqCst);
        drop_local(&self.values, &self.environments, key, environment);
        let l2_keys = self
            .environments
            .affected_by(environment)
            .into_iter()
            .map(|env| CacheKey::new(key, env).l2_key())
            .collect();
        self.delete_l2(l2_keys).await;
        self.publish(&self.config.bus.config_topic, key, environment)
            .await;
    }

    async fn propagate_flag(&self, key: &str) {
        self.flags.invalidate(&key.to_string());
        self.delete_l2(vec![crate::cache::flag_l2_key(key)]).await;
        self.publish(&self.config.bus.flag_topic, key, self.environments.global())
            .await;
    }
}

fn drop_local(
    values: &LocalCache<CacheKey, Resolved>,
    environments: &EnvironmentHierarchy,
    key: &str,
    environment: &str,
) {
    if environments.is_global(environment) {
        values.invalidate_matching(|k| k.key == key);
    } else {
        for env in environments.affected_by(environment) {
            values.invalidate(&CacheKey::new(key, env));
        }
    }
}
