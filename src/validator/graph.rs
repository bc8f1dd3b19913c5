//! Dependency graph checks.
//!
//! The service loads a [`DependencyView`]: the entries reachable from the
//! keys being written plus the entries whose own rules name a written key,
//! each with its effective value in the target environment and any proposed
//! values overlaid. Checks then run without I/O
//! and only touch edges reachable from the change.
//!
//! # Edges
//! `A → B` exists while A's value satisfies the `when` condition of A's
//! dependency on B. A write that activates an edge closing a loop is rejected
//! with `Cycle`.

use std::collections::{HashMap, HashSet};

use crate::error::ControlPlaneError;
use crate::model::{ConfigValue, ValidationRule};

#[derive(Debug, Clone)]
struct GraphNode {
    rule: ValidationRule,
    value: Option<ConfigValue>,
    proposed: bool,
}

/// Entries reachable from a change, with proposed values overlaid.
#[derive(Debug, Clone, Default)]
pub struct DependencyView {
    nodes: HashMap<String, GraphNode>,
}

impl DependencyView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the current state of an entry. `None` value means unset or absent.
    pub fn insert_current(
        &mut self,
        key: impl Into<String>,
        rule: ValidationRule,
        value: Option<ConfigValue>,
    ) {
        self.nodes.insert(
            key.into(),
            GraphNode {
                rule,
                value,
                proposed: false,
            },
        );
    }

    /// Overlay a value being written.
    pub fn insert_proposed(
        &mut self,
        key: impl Into<String>,
        rule: ValidationRule,
        value: Option<ConfigValue>,
    ) {
        self.nodes.insert(
            key.into(),
            GraphNode {
                rule,
                value,
                proposed: true,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&ConfigValue> {
        self.nodes.get(key).and_then(|n| n.value.as_ref())
    }

    /// Keys referenced by loaded nodes but not yet loaded.
    ///
    /// Follows active dependency edges from every node and conflict rules of
    /// proposed nodes. The loader calls this until it returns nothing.
    pub fn unresolved_keys(&self) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for (key, node) in &self.nodes {
            for target in self.active_edges(key) {
                if !self.nodes.contains_key(target) && !missing.iter().any(|m| m == target) {
                    missing.push(target.to_string());
                }
            }
            if node.proposed {
                for conflict in &node.rule.conflicts_with {
                    if !self.nodes.contains_key(&conflict.key)
                        && !missing.iter().any(|m| m == &conflict.key)
                    {
                        missing.push(conflict.key.clone());
                    }
                }
            }
        }
        missing
    }

    fn active_edges<'a>(&'a self, key: &str) -> Vec<&'a str> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };
        let Some(value) = &node.value else {
            return Vec::new();
        };
        node.rule
            .depends_on
            .iter()
            .filter(|d| d.is_active_for(value))
            .map(|d| d.key.as_str())
            .collect()
    }

    /// Depth-first search for a loop reachable from `start`.
    ///
    /// Returns the path, first node repeated at the end.
    pub fn find_cycle(&self, start: &str) -> Option<Vec<String>> {
        let mut stack: Vec<String> = Vec::new();
        let mut on_stack: HashSet<String> = HashSet::new();
        let mut done: HashSet<String> = HashSet::new();
        self.dfs(start, &mut stack, &mut on_stack, &mut done)
    }

    fn dfs(
        &self,
        key: &str,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(key) {
            let from = stack.iter().position(|k| k == key).unwrap_or(0);
            let mut path = stack[from..].to_vec();
            path.push(key.to_string());
            return Some(path);
        }
        if done.contains(key) {
            return None;
        }

        stack.push(key.to_string());
        on_stack.insert(key.to_string());

        for next in self.active_edges(key) {
            if let Some(path) = self.dfs(next, stack, on_stack, done) {
                return Some(path);
            }
        }

        stack.pop();
        on_stack.remove(key);
        done.insert(key.to_string());
        None
    }

    /// Run cycle, requirement and conflict checks for one written key.
    pub fn check_change(&self, key: &str) -> Result<(), ControlPlaneError> {
        if let Some(path) = self.find_cycle(key) {
            return Err(ControlPlaneError::Cycle { path });
        }

        let Some(node) = self.nodes.get(key) else {
            return Ok(());
        };

        if let Some(own) = &node.value {
            for dep in node.rule.depends_on.iter().filter(|d| d.is_active_for(own)) {
                match self.value(&dep.key) {
                    None => {
                        return Err(ControlPlaneError::DependencyConflict {
                            key: key.to_string(),
                            other: dep.key.clone(),
                            reason: "required key is not set".to_string(),
                        })
                    }
                    Some(other) => {
                        if let Some(cond) = &dep.requires {
                            if !cond.holds(other) {
                                return Err(ControlPlaneError::DependencyConflict {
                                    key: key.to_string(),
                                    other: dep.key.clone(),
                                    reason: format!("requires '{}' to be {cond}", dep.key),
                                });
                            }
                        }
                    }
                }
            }

            for rule in &node.rule.conflicts_with {
                if !rule.when.as_ref().map_or(true, |w| w.holds(own)) {
                    continue;
                }
                if let Some(other) = self.value(&rule.key) {
                    if rule.other.holds(other) {
                        return Err(ControlPlaneError::DependencyConflict {
                            key: key.to_string(),
                            other: rule.key.clone(),
                            reason: format!("not allowed while '{}' is {}", rule.key, rule.other),
                        });
                    }
                }
            }

            // Conflict rules declared on the other side.
            for (other_key, other_node) in &self.nodes {
                if other_key == key {
                    continue;
                }
                let Some(other_value) = &other_node.value else {
                    continue;
                };
                for rule in other_node.rule.conflicts_with.iter().filter(|r| r.key == key) {
                    let other_applies = rule.when.as_ref().map_or(true, |w| w.holds(other_value));
                    if other_applies && rule.other.holds(own) {
                        return Err(ControlPlaneError::DependencyConflict {
                            key: key.to_string(),
                            other: other_key.clone(),
                            reason: format!("'{other_key}' forbids '{key}' being {}", rule.other),
                        });
                    }
                }
            }
        }

        // Dependents already loaded whose requirement this value breaks.
        for (other_key, other_node) in &self.nodes {
            if other_key == key {
                continue;
            }
            let Some(other_value) = &other_node.value else {
                continue;
            };
            for dep in other_node
                .rule
                .depends_on
                .iter()
                .filter(|d| d.key == key && d.is_active_for(other_value))
            {
                let satisfied = match (&node.value, &dep.requires) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(v), Some(cond)) => cond.holds(v),
                };
                if !satisfied {
                    return Err(ControlPlaneError::DependencyConflict {
                        key: key.to_string(),
                        other: other_key.clone(),
                        reason: format!("'{other_key}' depends on '{key}'"),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictRule, Dependency, ValueCondition};
    use serde_json::json;

    fn depends(keys: &[&str]) -> ValidationRule {
        ValidationRule {
            depends_on: keys.iter().map(|k| Dependency::on(*k)).collect(),
            ..ValidationRule::default()
        }
    }

    fn on() -> Option<ConfigValue> {
        Some(ConfigValue::Boolean(true))
    }

    #[test]
    fn test_detects_cycle_with_path() {
        let mut view = DependencyView::new();
        view.insert_current("b", depends(&["c"]), on());
        view.insert_current("c", depends(&["a"]), on());
        view.insert_proposed("a", depends(&["b"]), on());

        assert!(view.unresolved_keys().is_empty());
        match view.check_change("a") {
            Err(ControlPlaneError::Cycle { path }) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_inactive_edge_breaks_cycle() {
        let conditional = ValidationRule {
            depends_on: vec![Dependency {
                key: "b".into(),
                when: Some(ValueCondition::Truthy),
                requires: None,
            }],
            ..ValidationRule::default()
        };
        let mut view = DependencyView::new();
        view.insert_current("b", depends(&["a"]), on());
        view.insert_proposed("a", conditional, Some(ConfigValue::Boolean(false)));
        assert!(view.find_cycle("a").is_none());
    }

    #[test]
    fn test_unresolved_keys_follow_active_edges() {
        let mut view = DependencyView::new();
        view.insert_proposed("a", depends(&["b", "c"]), on());
        let mut missing = view.unresolved_keys();
        missing.sort();
        assert_eq!(missing, vec!["b", "c"]);
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let mut view = DependencyView::new();
        view.insert_proposed("payments.enabled", depends(&["payments.provider"]), on());
        view.insert_current("payments.provider", ValidationRule::default(), None);
        assert!(matches!(
            view.check_change("payments.enabled"),
            Err(ControlPlaneError::DependencyConflict { .. })
        ));
    }

    #[test]
    fn test_required_condition() {
        let rule = ValidationRule {
            depends_on: vec![Dependency {
                key: "cache.enabled".into(),
                when: None,
                requires: Some(ValueCondition::Equals(json!(true))),
            }],
            ..ValidationRule::default()
        };
        let mut view = DependencyView::new();
        view.insert_proposed("cache.ttl", rule, Some(ConfigValue::Number(30.0)));
        view.insert_current(
            "cache.enabled",
            ValidationRule::default(),
            Some(ConfigValue::Boolean(false)),
        );
        assert!(view.check_change("cache.ttl").is_err());

        view.insert_current(
            "cache.enabled",
            ValidationRule::default(),
            Some(ConfigValue::Boolean(true)),
        );
        assert!(view.check_change("cache.ttl").is_ok());
    }

    #[test]
    fn test_conflicts_checked_both_directions() {
        let forward = ValidationRule {
            conflicts_with: vec![ConflictRule {
                key: "maintenance.mode".into(),
                when: Some(ValueCondition::Truthy),
                other: ValueCondition::Truthy,
            }],
            ..ValidationRule::default()
        };
        let mut view = DependencyView::new();
        view.insert_proposed("checkout.enabled", forward.clone(), on());
        view.insert_current("maintenance.mode", ValidationRule::default(), on());
        assert!(view.check_change("checkout.enabled").is_err());

        let mut reverse = DependencyView::new();
        reverse.insert_current(
            "checkout.enabled",
            ValidationRule {
                conflicts_with: vec![ConflictRule {
                    key: "maintenance.mode".into(),
                    when: None,
                    other: ValueCondition::Truthy,
                }],
                ..ValidationRule::default()
            },
            on(),
        );
        reverse.insert_proposed("maintenance.mode", ValidationRule::default(), on());
        assert!(reverse.check_change("maintenance.mode").is_err());
    }

    #[test]
    fn test_unsetting_required_key_rejected() {
        let mut view = DependencyView::new();
        view.insert_current("a", depends(&["b"]), on());
        view.insert_proposed("b", ValidationRule::default(), None);
        assert!(view.check_change("b").is_err());
    }
}
