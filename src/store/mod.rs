//! Durable configuration store.
//!
//! # Responsibilities
//! - Load entries, overrides, flags, templates and history
//! - Answer reverse lookups: which entries declare rules against a key
//! - Apply a batch of mutations atomically, each guarded by its version
//!   precondition
//!
//! # Design Decisions
//! - One `commit` entry point: a write, its history record and (for bulk
//!   writes) every other item land together or not at all
//! - A version precondition of `None` means "must not exist yet"
//! - Overrides share their entry's version: writing an override also puts
//!   the entry with a bumped version, so writes serialize per key
//! - Implementations must not be called directly by callers; the service's
//!   validated write path is the only writer

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    ChangeRecord, ConfigurationEntry, ConfigurationTemplate, EnvironmentOverride, FeatureFlag,
    HistoryKey,
};

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Precondition failed. `expected == 0` means the row had to be absent;
    /// `actual == 0` means it was.
    #[error("version mismatch on '{key}': expected {expected}, found {actual}")]
    VersionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One change inside a [`ConfigStore::commit`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PutEntry {
        entry: ConfigurationEntry,
        expected_version: Option<u64>,
    },
    PutOverride(EnvironmentOverride),
    PutFlag {
        flag: FeatureFlag,
        expected_version: Option<u64>,
    },
    PutTemplate {
        template: ConfigurationTemplate,
        expected_version: Option<u64>,
    },
    /// Count one more application. The store increments its own counter.
    RecordTemplateUsage {
        id: String,
        applied_at: DateTime<Utc>,
        template_version: u64,
    },
    AppendHistory(ChangeRecord),
}

impl Mutation {
    /// Key the precondition applies to, for conflict reporting.
    pub fn key(&self) -> &str {
        match self {
            Self::PutEntry { entry, .. } => &entry.key,
            Self::PutOverride(o) => &o.key,
            Self::PutFlag { flag, .. } => &flag.key,
            Self::PutTemplate { template, .. } => &template.id,
            Self::RecordTemplateUsage { id, .. } => id,
            Self::AppendHistory(record) => &record.target.key,
        }
    }
}

/// Persistence boundary.
#[async_trait]
pub trait ConfigStore: Send + Sync + std::fmt::Debug {
    async fn load_entry(&self, key: &str) -> StoreResult<Option<ConfigurationEntry>>;

    /// Active override only.
    async fn load_override(
        &self,
        key: &str,
        environment: &str,
    ) -> StoreResult<Option<EnvironmentOverride>>;

    /// Active overrides of one entry, every environment.
    async fn list_overrides(&self, key: &str) -> StoreResult<Vec<EnvironmentOverride>>;

    /// Entries ordered by key, optionally restricted to a category.
    async fn list_entries(&self, category: Option<&str>) -> StoreResult<Vec<ConfigurationEntry>>;

    /// Active entries whose dependency or conflict rules name `key`.
    async fn list_dependents(&self, key: &str) -> StoreResult<Vec<ConfigurationEntry>>;

    async fn load_flag(&self, key: &str) -> StoreResult<Option<FeatureFlag>>;

    async fn load_template(&self, id: &str) -> StoreResult<Option<ConfigurationTemplate>>;

    /// Newest first.
    async fn load_history(&self, target: &HistoryKey, limit: usize)
        -> StoreResult<Vec<ChangeRecord>>;

    /// Apply every mutation or none.
    async fn commit(&self, mutations: Vec<Mutation>) -> StoreResult<()>;

    async fn save_entry(
        &self,
        entry: ConfigurationEntry,
        expected_version: Option<u64>,
    ) -> StoreResult<()> {
        self.commit(vec![Mutation::PutEntry {
            entry,
            expected_version,
        }])
        .await
    }

    async fn append_history(&self, record: ChangeRecord) -> StoreResult<()> {
        self.commit(vec![Mutation::AppendHistory(record)]).await
    }
}
