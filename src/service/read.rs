//! Read path.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use serde_json::Value;

use crate::cache::CacheKey;
use crate::error::{ControlPlaneError, ControlPlaneResult, EntityKind};
use crate::model::{ConfigValue, ConfigurationEntry, EnvironmentOverride};
use crate::observability::metrics;
use crate::resilience::timeouts;
use crate::service::{ConfigurationService, Resolved, ValueSource};
use crate::validator::RuleViolation;

const REDACTED: &str = "[redacted]";

/// Values proposed by a pending write, keyed by (key, environment).
/// `None` marks a cleared override.
pub(crate) type Overlay = HashMap<(String, String), Option<Value>>;

/// Entry metadata with its active overrides. Sensitive values are redacted.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDetails {
    pub entry: ConfigurationEntry,
    pub overrides: Vec<EnvironmentOverride>,
}

impl ConfigurationService {
    /// Effective value of `key` in `environment`.
    ///
    /// Falls back to an expired local copy (marked `stale`) when the store
    /// is unreachable.
    pub async fn get(&self, key: &str, environment: &str) -> ControlPlaneResult<Resolved> {
        let cache_key = CacheKey::new(key, environment);
        if let Some(hit) = self.values.get(&cache_key) {
            return Ok((*hit).clone());
        }

        if let Some(resolved) = self.read_l2(&cache_key).await {
            self.values.insert(cache_key, resolved.clone());
            return Ok(resolved);
        }

        let epoch = self.write_epoch.load(Ordering::SeqCst);
        match self.resolve_from_store(key, environment).await {
            Ok(resolved) => {
                self.fill(cache_key, &resolved, epoch).await;
                Ok(resolved)
            }
            Err(ControlPlaneError::StoreUnavailable(reason)) => {
                match self.values.get_stale(&cache_key) {
                    Some(stale) => {
                        tracing::warn!(
                            key,
                            environment,
                            reason = %reason,
                            "Store unavailable, serving stale value"
                        );
                        let mut resolved = (*stale).clone();
                        resolved.stale = true;
                        Ok(resolved)
                    }
                    None => Err(ControlPlaneError::StoreUnavailable(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Effective value, or `default` when the key is unknown or inactive.
    pub async fn get_or(
        &self,
        key: &str,
        environment: &str,
        default: Value,
    ) -> ControlPlaneResult<ConfigValue> {
        match self.get(key, environment).await {
            Ok(resolved) => Ok(resolved.value),
            Err(ControlPlaneError::NotFound { .. }) => Ok(ConfigValue::infer(default)),
            Err(e) => Err(e),
        }
    }

    /// Entry metadata and overrides straight from the store.
    pub async fn get_entry(&self, key: &str) -> ControlPlaneResult<EntryDetails> {
        let entry = self
            .load_entry(key)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found(EntityKind::Configuration, key))?;
        let overrides = timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.list_overrides(key),
        )
        .await?;

        if entry.is_sensitive {
            Ok(EntryDetails {
                entry: redact_entry(entry),
                overrides: overrides.into_iter().map(redact_override).collect(),
            })
        } else {
            Ok(EntryDetails { entry, overrides })
        }
    }

    /// Entries ordered by key, optionally in one category. Sensitive values
    /// are redacted.
    pub async fn list_entries(
        &self,
        category: Option<&str>,
    ) -> ControlPlaneResult<Vec<ConfigurationEntry>> {
        let entries = timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.list_entries(category),
        )
        .await?;
        Ok(entries
            .into_iter()
            .map(|e| if e.is_sensitive { redact_entry(e) } else { e })
            .collect())
    }

    async fn read_l2(&self, cache_key: &CacheKey) -> Option<Resolved> {
        let fetched = timeouts::cache_call(
            self.config.store.cache_timeout(),
            self.deps.l2.get(&cache_key.l2_key()),
        )
        .await;
        match fetched {
            Ok(Some(payload)) => match serde_json::from_str::<Resolved>(&payload) {
                Ok(resolved) => {
                    metrics::record_cache_lookup("l2", "hit");
                    Some(resolved)
                }
                Err(e) => {
                    tracing::warn!(key = %cache_key.key, error = %e, "Discarding corrupt L2 payload");
                    None
                }
            },
            Ok(None) => {
                metrics::record_cache_lookup("l2", "miss");
                None
            }
            Err(e) => {
                metrics::record_cache_lookup("l2", "error");
                tracing::debug!(key = %cache_key.key, error = %e, "L2 unavailable on read");
                None
            }
        }
    }

    /// L2 only holds declared environments and the global scope, the set a
    /// writer knows to delete.
    /// Cache a store resolution read under `epoch`. A write that lands
    /// before the fill completes may already have deleted the L2 key, so
    /// the fill is undone rather than left to outlive it.
    async fn fill(&self, cache_key: CacheKey, resolved: &Resolved, epoch: u64) {
        let raced = || self.write_epoch.load(Ordering::SeqCst) != epoch;
        if raced() {
            tracing::debug!(
                key = %cache_key.key,
                environment = %cache_key.environment,
                "Write overlapped read, not caching"
            );
            return;
        }
        self.write_l2(&cache_key, resolved).await;
        if raced() {
            self.delete_l2(vec![cache_key.l2_key()]).await;
            return;
        }
        self.values.insert(cache_key, resolved.clone());
    }

    async fn write_l2(&self, cache_key: &CacheKey, resolved: &Resolved) {
        let env = &cache_key.environment;
        if !self.environments.is_global(env) && !self.environments.is_declared(env) {
            return;
        }
        let payload = match serde_json::to_string(resolved) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(key = %cache_key.key, error = %e, "Failed to encode L2 payload");
                return;
            }
        };
        let stored = timeouts::cache_call(
            self.config.store.cache_timeout(),
            self.deps.l2.set(&cache_key.l2_key(), payload, self.config.cache.l2_ttl()),
        )
        .await;
        if let Err(e) = stored {
            tracing::debug!(key = %cache_key.key, error = %e, "L2 fill failed");
        }
    }

    pub(crate) async fn load_entry(
        &self,
        key: &str,
    ) -> ControlPlaneResult<Option<ConfigurationEntry>> {
        Ok(timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.load_entry(key),
        )
        .await?)
    }

    /// Active entry or `NotFound`.
    pub(crate) async fn require_entry(&self, key: &str) -> ControlPlaneResult<ConfigurationEntry> {
        match self.load_entry(key).await? {
            Some(entry) if entry.is_active => Ok(entry),
            _ => Err(ControlPlaneError::not_found(EntityKind::Configuration, key)),
        }
    }

    pub(crate) async fn load_override(
        &self,
        key: &str,
        environment: &str,
    ) -> ControlPlaneResult<Option<EnvironmentOverride>> {
        Ok(timeouts::store_call(
            self.config.store.call_timeout(),
            self.deps.store.load_override(key, environment),
        )
        .await?)
    }

    async fn resolve_from_store(
        &self,
        key: &str,
        environment: &str,
    ) -> ControlPlaneResult<Resolved> {
        let entry = self.require_entry(key).await?;
        let (raw, source) = self
            .resolve_raw(&entry, environment, &Overlay::new())
            .await?
            .ok_or_else(|| ControlPlaneError::not_found(EntityKind::Configuration, key))?;
        let value = coerce_stored(&entry, &raw)?;
        Ok(Resolved {
            key: key.to_string(),
            environment: environment.to_string(),
            value,
            source,
            version: entry.version,
            is_sensitive: entry.is_sensitive,
            requires_restart: entry.requires_restart,
            stale: false,
        })
    }

    /// Walk override chain → global → default, with pending writes overlaid.
    pub(crate) async fn resolve_raw(
        &self,
        entry: &ConfigurationEntry,
        environment: &str,
        overlay: &Overlay,
    ) -> ControlPlaneResult<Option<(Value, ValueSource)>> {
        for env in self.environments.chain(environment) {
            let proposed = overlay.get(&(entry.key.clone(), env.clone()));
            let found = match proposed {
                Some(Some(value)) => Some(value.clone()),
                Some(None) => None,
                None => self.load_override(&entry.key, &env).await?.map(|o| o.value),
            };
            if let Some(value) = found {
                return Ok(Some((value, ValueSource::Override { environment: env })));
            }
        }

        let global_key = (entry.key.clone(), self.environments.global().to_string());
        let global = match overlay.get(&global_key) {
            Some(proposed) => proposed.clone(),
            None => entry.value.clone(),
        };
        if let Some(value) = global {
            return Ok(Some((value, ValueSource::Global)));
        }
        Ok(entry
            .default_value
            .clone()
            .map(|value| (value, ValueSource::Default)))
    }

    /// Typed effective value, `None` when nothing resolves.
    pub(crate) async fn effective_value(
        &self,
        entry: &ConfigurationEntry,
        environment: &str,
        overlay: &Overlay,
    ) -> ControlPlaneResult<Option<ConfigValue>> {
        match self.resolve_raw(entry, environment, overlay).await? {
            Some((raw, _)) => Ok(Some(coerce_stored(entry, &raw)?)),
            None => Ok(None),
        }
    }
}

/// Stored values passed validation when written; a mismatch here means the
/// entry's type was changed underneath them.
fn coerce_stored(entry: &ConfigurationEntry, raw: &Value) -> ControlPlaneResult<ConfigValue> {
    ConfigValue::coerce(raw, entry.data_type).map_err(|m| ControlPlaneError::Validation {
        key: entry.key.clone(),
        violations: vec![RuleViolation::TypeMismatch {
            expected: m.expected,
            found: m.found,
        }],
    })
}

fn redact_entry(mut entry: ConfigurationEntry) -> ConfigurationEntry {
    if entry.value.is_some() {
        entry.value = Some(Value::String(REDACTED.to_string()));
    }
    if entry.default_value.is_some() {
        entry.default_value = Some(Value::String(REDACTED.to_string()));
    }
    entry
}

fn redact_override(mut o: EnvironmentOverride) -> EnvironmentOverride {
    o.value = Value::String(REDACTED.to_string());
    o
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlPlaneConfig;
    use crate::lifecycle::ControlPlane;
    use crate::model::{ChangeContext, DataType};
    use serde_json::json;

    async fn plane_with_retries() -> ControlPlane {
        let plane = ControlPlane::builder(ControlPlaneConfig::default())
            .build()
            .unwrap();
        plane
            .service
            .create_entry(
                ConfigurationEntry::new("checkout.maxRetries", DataType::Number).with_value(json!(3)),
                &ChangeContext::new("ops", "test"),
            )
            .await
            .unwrap();
        plane
    }

    #[tokio::test]
    async fn test_fill_caches_both_tiers() {
        let plane = plane_with_retries().await;
        let service = &plane.service;
        let cache_key = CacheKey::new("checkout.maxRetries", "production");

        let epoch = service.write_epoch.load(Ordering::SeqCst);
        let resolved = service.resolve_from_store("checkout.maxRetries", "production").await.unwrap();
        service.fill(cache_key.clone(), &resolved, epoch).await;

        assert!(service.read_l2(&cache_key).await.is_some());
        assert!(service.values.get(&cache_key).is_some());
    }

    #[tokio::test]
    async fn test_fill_overlapping_a_write_is_dropped() {
        let plane = plane_with_retries().await;
        let service = &plane.service;
        let cache_key = CacheKey::new("checkout.maxRetries", "production");

        let epoch = service.write_epoch.load(Ordering::SeqCst);
        let before = service.resolve_from_store("checkout.maxRetries", "production").await.unwrap();
        service
            .set("checkout.maxRetries", json!(4), "production", &ChangeContext::new("ops", "test"))
            .await
            .unwrap();
        service.fill(cache_key.clone(), &before, epoch).await;

        assert!(service.read_l2(&cache_key).await.is_none());
        assert!(service.values.get(&cache_key).is_none());
        let current = service.get("checkout.maxRetries", "production").await.unwrap();
        assert_eq!(current.value.as_f64(), Some(4.0));
    }
}
