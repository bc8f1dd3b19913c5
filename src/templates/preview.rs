//! Template previews.

use serde::Serialize;
use serde_json::Value;

use crate::error::ControlPlaneError;
use crate::service::{BulkItem, PlannedItem};

const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Value,
    Flag,
}

/// One template item against the current state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewItem {
    pub kind: ItemKind,
    pub key: String,
    pub current: Option<Value>,
    pub proposed: Option<Value>,
    /// Applying would change the stored value.
    pub changes: bool,
    /// Why applying this item would fail.
    pub issue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplatePreview {
    pub template_id: String,
    pub template_version: u64,
    pub environment: String,
    pub items: Vec<PreviewItem>,
}

impl TemplatePreview {
    /// Every item would apply cleanly.
    pub fn is_clean(&self) -> bool {
        self.items.iter().all(|i| i.issue.is_none())
    }

    pub fn changed(&self) -> impl Iterator<Item = &PreviewItem> {
        self.items.iter().filter(|i| i.changes)
    }
}

pub(crate) fn preview_item(
    item: &BulkItem,
    planned: &Result<PlannedItem, ControlPlaneError>,
) -> PreviewItem {
    let kind = match item {
        BulkItem::Value { .. } => ItemKind::Value,
        BulkItem::Flag { .. } => ItemKind::Flag,
    };
    match planned {
        Ok(plan) => {
            let (current, proposed) = (plan.current(), plan.proposed());
            let changes = current != proposed;
            let (current, proposed) = if plan.is_sensitive() {
                (redact(current), redact(proposed))
            } else {
                (current, proposed)
            };
            PreviewItem {
                kind,
                key: item.key().to_string(),
                current,
                proposed,
                changes,
                issue: None,
            }
        }
        Err(e) => PreviewItem {
            kind,
            key: item.key().to_string(),
            current: None,
            proposed: match item {
                BulkItem::Value { value, .. } => Some(value.clone()),
                BulkItem::Flag { patch, .. } => serde_json::to_value(patch).ok(),
            },
            changes: true,
            issue: Some(e.to_string()),
        },
    }
}

fn redact(value: Option<Value>) -> Option<Value> {
    value.map(|_| Value::String(REDACTED.to_string()))
}
