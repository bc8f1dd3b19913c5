//! Batched writes.
//!
//! # Data Flow
//! ```text
//! items → per-item load + validate
//!       → dependency checks with every surviving item overlaid
//!         (repeated until no further item fails)
//!       → one store commit for everything that survived
//!       → cache fan-out and audit per applied item
//! ```
//!
//! # Design Decisions
//! - Items are checked together, so a batch may set a key and the key
//!   that depends on it in one go
//! - `AbortAll` commits nothing if any item fails; `BestEffort` commits
//!   the items whose checks passed, and drops items that depend on a
//!   failed one
//! - A version conflict at commit time fails the conflicting key's items
//!   and re-plans the rest (best effort) or fails the batch (abort all)

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::model::{ChangeContext, ChangeKind, ChangeRecord, FlagPatch};
use crate::service::flags::PreparedFlag;
use crate::service::read::Overlay;
use crate::service::write::{KeyWrites, PreparedWrite};
use crate::service::ConfigurationService;
use crate::store::Mutation;

/// One change in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkItem {
    Value {
        key: String,
        environment: String,
        value: Value,
    },
    Flag {
        key: String,
        patch: FlagPatch,
    },
}

impl BulkItem {
    pub fn value(key: impl Into<String>, environment: impl Into<String>, value: Value) -> Self {
        Self::Value {
            key: key.into(),
            environment: environment.into(),
            value,
        }
    }

    pub fn flag(key: impl Into<String>, patch: FlagPatch) -> Self {
        Self::Flag {
            key: key.into(),
            patch,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Value { key, .. } | Self::Flag { key, .. } => key,
        }
    }

    fn identity(&self) -> (bool, &str, &str) {
        match self {
            Self::Value {
                key, environment, ..
            } => (false, key, environment),
            Self::Flag { key, .. } => (true, key, ""),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    #[default]
    AbortAll,
    BestEffort,
}

#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Applied { version: u64 },
    Failed(ControlPlaneError),
    /// Not attempted because another item failed under `AbortAll`.
    Skipped,
}

impl ItemOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Per-item results, in request order.
#[derive(Debug, Clone)]
pub struct BulkReport {
    pub committed: bool,
    pub outcomes: Vec<ItemOutcome>,
}

impl BulkReport {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Failed(_)))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.committed && self.applied() == self.outcomes.len()
    }
}

/// A batch item after loading and validation.
#[derive(Debug, Clone)]
pub(crate) enum PlannedItem {
    Value(PreparedWrite),
    Flag(PreparedFlag),
}

impl PlannedItem {
    pub fn current(&self) -> Option<Value> {
        match self {
            Self::Value(w) => w.previous.clone(),
            Self::Flag(f) => f.previous_definition(),
        }
    }

    pub fn proposed(&self) -> Option<Value> {
        match self {
            Self::Value(w) => w.value.clone(),
            Self::Flag(f) => Some(f.next.definition_json()),
        }
    }

    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Value(w) if w.entry.is_sensitive)
    }
}

pub(crate) type Plan = Vec<Result<PlannedItem, ControlPlaneError>>;

impl ConfigurationService {
    /// Apply several changes together under `policy`.
    ///
    /// Item-level failures are reported in the [`BulkReport`]; `Err` means
    /// the batch itself could not be processed.
    pub async fn bulk_set(
        &self,
        items: &[BulkItem],
        policy: PartialFailurePolicy,
        ctx: &ChangeContext,
    ) -> ControlPlaneResult<BulkReport> {
        self.bulk_write(items, policy, ctx, ChangeKind::Update).await
    }

    pub(crate) async fn bulk_write(
        &self,
        items: &[BulkItem],
        policy: PartialFailurePolicy,
        ctx: &ChangeContext,
        kind: ChangeKind,
    ) -> ControlPlaneResult<BulkReport> {
        check_duplicates(items)?;
        let mut forced: HashMap<usize, ControlPlaneError> = HashMap::new();

        // Each conflict retry removes at least one key from the batch.
        for _ in 0..=items.len() {
            let mut plan = self.plan_bulk(items).await?;
            for (index, err) in &forced {
                plan[*index] = Err(err.clone());
            }
            self.settle_dependencies(items, &mut plan, policy).await?;

            if plan.iter().any(Result::is_err) && policy == PartialFailurePolicy::AbortAll {
                return Ok(aborted(plan));
            }

            let (mutations, records) = self.bulk_mutations(&plan, ctx, &kind);
            if mutations.is_empty() {
                return Ok(finished(plan, &records, false));
            }

            match self.commit(mutations).await {
                Ok(()) => {
                    for (item, record) in plan.iter().zip(&records) {
                        match (item, record) {
                            (Ok(PlannedItem::Value(w)), Some(r)) => {
                                self.after_config_write(w, r).await
                            }
                            (Ok(PlannedItem::Flag(f)), Some(r)) => self.after_flag_write(f, r).await,
                            _ => {}
                        }
                    }
                    tracing::info!(
                        items = items.len(),
                        applied = records.iter().filter(|r| r.is_some()).count(),
                        actor = %ctx.actor,
                        "Bulk write committed"
                    );
                    return Ok(finished(plan, &records, true));
                }
                Err(ControlPlaneError::Conflict {
                    key,
                    expected,
                    actual,
                }) => {
                    tracing::warn!(key = %key, expected, actual, "Bulk write hit a version conflict");
                    let conflict = ControlPlaneError::Conflict {
                        key: key.clone(),
                        expected,
                        actual,
                    };
                    for (index, item) in items.iter().enumerate() {
                        if item.key() == key {
                            forced.insert(index, conflict.clone());
                        }
                    }
                    if policy == PartialFailurePolicy::AbortAll {
                        return Ok(BulkReport {
                            committed: false,
                            outcomes: (0..items.len())
                                .map(|i| match forced.get(&i) {
                                    Some(err) => ItemOutcome::Failed(err.clone()),
                                    None => ItemOutcome::Skipped,
                                })
                                .collect(),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ControlPlaneError::StoreUnavailable(
            "bulk write kept conflicting with concurrent writers".to_string(),
        ))
    }

    /// Load and validate every item without writing anything. Dependency
    /// checks see all surviving items together.
    pub(crate) async fn dry_run_bulk(&self, items: &[BulkItem]) -> ControlPlaneResult<Plan> {
        check_duplicates(items)?;
        let mut plan = self.plan_bulk(items).await?;
        self.settle_dependencies(items, &mut plan, PartialFailurePolicy::BestEffort)
            .await?;
        Ok(plan)
    }

    async fn plan_bulk(&self, items: &[BulkItem]) -> ControlPlaneResult<Plan> {
        let mut plan = Vec::with_capacity(items.len());
        for item in items {
            let planned = match item {
                BulkItem::Value {
                    key,
                    environment,
                    value,
                } => self
                    .load_value_item(key, environment, value)
                    .await
                    .map(PlannedItem::Value),
                BulkItem::Flag { key, patch } => self
                    .prepare_flag_upsert(key, patch)
                    .await
                    .map(PlannedItem::Flag),
            };
            match planned {
                Err(e @ ControlPlaneError::StoreUnavailable(_)) => return Err(e),
                other => plan.push(other),
            }
        }
        Ok(plan)
    }

    async fn load_value_item(
        &self,
        key: &str,
        environment: &str,
        value: &Value,
    ) -> ControlPlaneResult<PreparedWrite> {
        let entry = self.require_entry(key).await?;
        let previous = if self.environments.is_global(environment) {
            entry.value.clone()
        } else {
            self.load_override(key, environment).await?.map(|o| o.value)
        };
        let typed = self.validator.validate(&entry, value)?;
        Ok(PreparedWrite {
            value: Some(typed.to_json()),
            typed: Some(typed),
            previous,
            environment: environment.to_string(),
            entry,
        })
    }

    /// Fail items whose dependency checks break, until the surviving set is
    /// stable. Under `AbortAll` the first round of failures is final.
    async fn settle_dependencies(
        &self,
        items: &[BulkItem],
        plan: &mut Plan,
        policy: PartialFailurePolicy,
    ) -> ControlPlaneResult<()> {
        loop {
            let mut overlay = Overlay::new();
            let mut by_env: HashMap<String, Vec<usize>> = HashMap::new();
            for (index, planned) in plan.iter().enumerate() {
                if let Ok(PlannedItem::Value(w)) = planned {
                    overlay.insert(
                        (w.entry.key.clone(), w.environment.clone()),
                        w.value.clone(),
                    );
                    by_env.entry(w.environment.clone()).or_default().push(index);
                }
            }

            let mut failures: Vec<(usize, ControlPlaneError)> = Vec::new();
            for (environment, indices) in &by_env {
                let written: Vec<_> = indices
                    .iter()
                    .filter_map(|i| match &plan[*i] {
                        Ok(PlannedItem::Value(w)) => Some(&w.entry),
                        _ => None,
                    })
                    .collect();
                let view = self
                    .dependency_view(environment, &written, &overlay)
                    .await?;
                for index in indices {
                    if let Err(e) = view.check_change(items[*index].key()) {
                        failures.push((*index, e));
                    }
                }
            }

            if failures.is_empty() {
                return Ok(());
            }
            for (index, err) in failures {
                plan[index] = Err(err);
            }
            if policy == PartialFailurePolicy::AbortAll {
                return Ok(());
            }
        }
    }

    /// One commit batch for every planned item. Records line up with `plan`.
    fn bulk_mutations(
        &self,
        plan: &Plan,
        ctx: &ChangeContext,
        kind: &ChangeKind,
    ) -> (Vec<Mutation>, Vec<Option<ChangeRecord>>) {
        let now = self.deps.clock.now();
        let mut per_key: Vec<(String, KeyWrites)> = Vec::new();
        let mut flag_mutations = Vec::new();
        let mut records = Vec::with_capacity(plan.len());

        for planned in plan {
            match planned {
                Ok(PlannedItem::Value(w)) => {
                    let position = match per_key.iter().position(|(k, _)| *k == w.entry.key) {
                        Some(p) => p,
                        None => {
                            per_key.push((
                                w.entry.key.clone(),
                                KeyWrites::new(&w.entry, self.environments.global()),
                            ));
                            per_key.len() - 1
                        }
                    };
                    let record = per_key[position].1.push(w, ctx, kind.clone(), now);
                    records.push(Some(record));
                }
                Ok(PlannedItem::Flag(f)) => {
                    let (mutations, record, _) = self.flag_mutations(f.clone(), ctx, kind.clone());
                    flag_mutations.extend(mutations);
                    records.push(Some(record));
                }
                Err(_) => records.push(None),
            }
        }

        let mut mutations: Vec<Mutation> = per_key
            .into_iter()
            .flat_map(|(_, writes)| writes.into_mutations())
            .collect();
        mutations.extend(flag_mutations);
        (mutations, records)
    }
}

fn check_duplicates(items: &[BulkItem]) -> ControlPlaneResult<()> {
    if items.is_empty() {
        return Err(ControlPlaneError::InvalidRequest(
            "bulk write has no items".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    let mut duplicates = BTreeSet::new();
    for item in items {
        if !seen.insert(item.identity()) {
            duplicates.insert(item.key().to_string());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ControlPlaneError::InvalidRequest(format!(
            "bulk write touches the same target twice: {}",
            duplicates.into_iter().collect::<Vec<_>>().join(", ")
        )))
    }
}

fn aborted(plan: Plan) -> BulkReport {
    BulkReport {
        committed: false,
        outcomes: plan
            .into_iter()
            .map(|p| match p {
                Ok(_) => ItemOutcome::Skipped,
                Err(e) => ItemOutcome::Failed(e),
            })
            .collect(),
    }
}

fn finished(plan: Plan, records: &[Option<ChangeRecord>], committed: bool) -> BulkReport {
    BulkReport {
        committed,
        outcomes: plan
            .into_iter()
            .zip(records)
            .map(|(p, r)| match (p, r) {
                (Err(e), _) => ItemOutcome::Failed(e),
                (Ok(_), Some(r)) => ItemOutcome::Applied { version: r.version },
                (Ok(_), None) => ItemOutcome::Skipped,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_targets_rejected() {
        let items = vec![
            BulkItem::value("a", "staging", json!(1)),
            BulkItem::value("a", "production", json!(2)),
            BulkItem::value("a", "staging", json!(3)),
        ];
        match check_duplicates(&items) {
            Err(ControlPlaneError::InvalidRequest(msg)) => assert!(msg.contains("a")),
            other => panic!("expected invalid request, got {other:?}"),
        }
        assert!(check_duplicates(&items[..2]).is_ok());
        assert!(check_duplicates(&[]).is_err());
    }

    #[test]
    fn test_flag_and_value_with_same_key_are_distinct() {
        let items = vec![
            BulkItem::value("checkout", "global", json!(true)),
            BulkItem::flag("checkout", FlagPatch::enable()),
        ];
        assert!(check_duplicates(&items).is_ok());
    }

    #[test]
    fn test_report_counts() {
        let report = BulkReport {
            committed: true,
            outcomes: vec![
                ItemOutcome::Applied { version: 2 },
                ItemOutcome::Failed(ControlPlaneError::InvalidRequest("x".into())),
                ItemOutcome::Skipped,
            ],
        };
        assert_eq!(report.applied(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_bulk_item_serde_shape() {
        let item: BulkItem = serde_json::from_value(json!({
            "type": "value",
            "key": "checkout.maxRetries",
            "environment": "production",
            "value": 4
        }))
        .unwrap();
        assert_eq!(item.key(), "checkout.maxRetries");
    }
}
