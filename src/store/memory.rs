//! In-memory store.
//!
//! Reference implementation of [`ConfigStore`] and the test harness for
//! everything above it. Supports injected outages and latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::model::{
    ChangeRecord, ConfigurationEntry, ConfigurationTemplate, EnvironmentOverride, FeatureFlag,
    HistoryKey,
};
use crate::store::{ConfigStore, Mutation, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    entries: HashMap<String, ConfigurationEntry>,
    overrides: HashMap<(String, String), EnvironmentOverride>,
    flags: HashMap<String, FeatureFlag>,
    templates: HashMap<String, ConfigurationTemplate>,
    history: HashMap<HistoryKey, Vec<ChangeRecord>>,
}

impl Tables {
    fn check(&self, mutation: &Mutation) -> StoreResult<()> {
        let (key, expected, actual) = match mutation {
            Mutation::PutEntry {
                entry,
                expected_version,
            } => (
                &entry.key,
                *expected_version,
                self.entries.get(&entry.key).map(|e| e.version),
            ),
            Mutation::PutFlag {
                flag,
                expected_version,
            } => (
                &flag.key,
                *expected_version,
                self.flags.get(&flag.key).map(|f| f.version),
            ),
            Mutation::PutTemplate {
                template,
                expected_version,
            } => (
                &template.id,
                *expected_version,
                self.templates.get(&template.id).map(|t| t.version),
            ),
            _ => return Ok(()),
        };
        if expected == actual {
            Ok(())
        } else {
            Err(StoreError::VersionMismatch {
                key: key.clone(),
                expected: expected.unwrap_or(0),
                actual: actual.unwrap_or(0),
            })
        }
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutEntry { entry, .. } => {
                self.entries.insert(entry.key.clone(), entry);
            }
            Mutation::PutOverride(o) => {
                self.overrides
                    .insert((o.key.clone(), o.environment.clone()), o);
            }
            Mutation::PutFlag { flag, .. } => {
                self.flags.insert(flag.key.clone(), flag);
            }
            Mutation::PutTemplate { mut template, .. } => {
                // Usage is owned by RecordTemplateUsage.
                if let Some(stored) = self.templates.get(&template.id) {
                    template.usage = stored.usage.clone();
                }
                self.templates.insert(template.id.clone(), template);
            }
            Mutation::RecordTemplateUsage {
                id,
                applied_at,
                template_version,
            } => {
                if let Some(template) = self.templates.get_mut(&id) {
                    template.usage.record(applied_at, template_version);
                }
            }
            Mutation::AppendHistory(record) => {
                self.history
                    .entry(record.target.clone())
                    .or_default()
                    .push(record);
            }
        }
    }
}

/// [`ConfigStore`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    latency_millis: AtomicU64,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure injection: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Failure injection: delay every call.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_millis.store(millis, Ordering::SeqCst);
    }

    /// Number of calls received, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_entry(&self, key: &str) -> StoreResult<Option<ConfigurationEntry>> {
        self.enter().await?;
        Ok(self.tables.read().entries.get(key).cloned())
    }

    async fn load_override(
        &self,
        key: &str,
        environment: &str,
    ) -> StoreResult<Option<EnvironmentOverride>> {
        self.enter().await?;
        Ok(self
            .tables
            .read()
            .overrides
            .get(&(key.to_string(), environment.to_string()))
            .filter(|o| o.is_active)
            .cloned())
    }

    async fn list_overrides(&self, key: &str) -> StoreResult<Vec<EnvironmentOverride>> {
        self.enter().await?;
        let tables = self.tables.read();
        let mut overrides: Vec<_> = tables
            .overrides
            .values()
            .filter(|o| o.key == key && o.is_active)
            .cloned()
            .collect();
        overrides.sort_by(|a, b| a.environment.cmp(&b.environment));
        Ok(overrides)
    }

    async fn list_entries(&self, category: Option<&str>) -> StoreResult<Vec<ConfigurationEntry>> {
        self.enter().await?;
        let tables = self.tables.read();
        let mut entries: Vec<_> = tables
            .entries
            .values()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn list_dependents(&self, key: &str) -> StoreResult<Vec<ConfigurationEntry>> {
        self.enter().await?;
        let tables = self.tables.read();
        let mut dependents: Vec<_> = tables
            .entries
            .values()
            .filter(|e| e.is_active && e.key != key && e.validation.references(key))
            .cloned()
            .collect();
        dependents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(dependents)
    }

    async fn load_flag(&self, key: &str) -> StoreResult<Option<FeatureFlag>> {
        self.enter().await?;
        Ok(self.tables.read().flags.get(key).cloned())
    }

    async fn load_template(&self, id: &str) -> StoreResult<Option<ConfigurationTemplate>> {
        self.enter().await?;
        Ok(self.tables.read().templates.get(id).cloned())
    }

    async fn load_history(
        &self,
        target: &HistoryKey,
        limit: usize,
    ) -> StoreResult<Vec<ChangeRecord>> {
        self.enter().await?;
        Ok(self
            .tables
            .read()
            .history
            .get(target)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> StoreResult<()> {
        self.enter().await?;
        let mut tables = self.tables.write();
        for mutation in &mutations {
            tables.check(mutation)?;
        }
        for mutation in mutations {
            tables.apply(mutation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeKind, DataType};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn entry(version: u64) -> ConfigurationEntry {
        let mut e = ConfigurationEntry::new("checkout.maxRetries", DataType::Number)
            .with_value(json!(3));
        e.version = version;
        e
    }

    fn record(version: u64) -> ChangeRecord {
        ChangeRecord {
            id: Uuid::new_v4(),
            target: HistoryKey::configuration("checkout.maxRetries", "global"),
            previous_value: None,
            new_value: Some(json!(version)),
            actor: "ops".into(),
            reason: "test".into(),
            timestamp: Utc::now(),
            version,
            kind: ChangeKind::Update,
        }
    }

    #[tokio::test]
    async fn test_version_preconditions() {
        let store = MemoryStore::new();
        store.save_entry(entry(1), None).await.unwrap();

        // Creating again fails.
        let err = store.save_entry(entry(1), None).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionMismatch {
                key: "checkout.maxRetries".into(),
                expected: 0,
                actual: 1
            }
        );

        store.save_entry(entry(2), Some(1)).await.unwrap();
        assert!(store.save_entry(entry(3), Some(1)).await.is_err());
        assert_eq!(
            store.load_entry("checkout.maxRetries").await.unwrap().unwrap().version,
            2
        );
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let store = MemoryStore::new();
        store.save_entry(entry(1), None).await.unwrap();

        let result = store
            .commit(vec![
                Mutation::AppendHistory(record(2)),
                Mutation::PutEntry {
                    entry: entry(2),
                    expected_version: Some(5),
                },
            ])
            .await;
        assert!(result.is_err());

        let target = HistoryKey::configuration("checkout.maxRetries", "global");
        assert!(store.load_history(&target, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_template_usage_accumulates_across_commits() {
        let store = MemoryStore::new();
        let mut template = ConfigurationTemplate::new("blackFriday");
        template.version = 2;
        store
            .commit(vec![Mutation::PutTemplate {
                template,
                expected_version: None,
            }])
            .await
            .unwrap();

        let first = Utc::now();
        let later = first + chrono::Duration::seconds(5);
        // Two applies that both read count 0 before recording.
        for at in [later, first] {
            store
                .commit(vec![Mutation::RecordTemplateUsage {
                    id: "blackFriday".into(),
                    applied_at: at,
                    template_version: 2,
                }])
                .await
                .unwrap();
        }

        let usage = store.load_template("blackFriday").await.unwrap().unwrap().usage;
        assert_eq!(usage.count, 2);
        assert_eq!(usage.last_applied_at, Some(later));
        assert_eq!(usage.last_applied_version, Some(2));
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = MemoryStore::new();
        for v in 1..=3 {
            store.append_history(record(v)).await.unwrap();
        }
        let target = HistoryKey::configuration("checkout.maxRetries", "global");
        let versions: Vec<u64> = store
            .load_history(&target, 2)
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_list_dependents_finds_rules_naming_key() {
        use crate::model::{ConflictRule, Dependency, ValidationRule, ValueCondition};

        let store = MemoryStore::new();
        let mut ttl = ConfigurationEntry::new("cache.ttl", DataType::Number);
        ttl.validation = ValidationRule {
            depends_on: vec![Dependency::on("cache.enabled")],
            ..ValidationRule::default()
        };
        let mut checkout = ConfigurationEntry::new("checkout.enabled", DataType::Boolean);
        checkout.validation = ValidationRule {
            conflicts_with: vec![ConflictRule {
                key: "cache.enabled".into(),
                when: None,
                other: ValueCondition::Truthy,
            }],
            ..ValidationRule::default()
        };
        let mut retired = ttl.clone();
        retired.key = "cache.legacyTtl".into();
        retired.is_active = false;
        for e in [ttl, checkout, retired, entry(1)] {
            store.save_entry(e, None).await.unwrap();
        }

        let keys: Vec<String> = store
            .list_dependents("cache.enabled")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["cache.ttl", "checkout.enabled"]);
        assert!(store.list_dependents("checkout.maxRetries").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_outage_counts_calls() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.load_entry("x").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.load_entry("x").await.unwrap().is_none());
        assert_eq!(store.call_count(), 2);
    }
}
