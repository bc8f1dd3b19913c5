//! Environment hierarchy.
//!
//! A read in environment `E` tries the override for `E`, then the overrides
//! of `E`'s declared ancestors, then the entry's global value and default.

use std::collections::HashMap;

use crate::config::EnvironmentsConfig;

#[derive(Debug, Clone)]
pub struct EnvironmentHierarchy {
    global: String,
    declared: Vec<String>,
    parents: HashMap<String, Option<String>>,
}

impl EnvironmentHierarchy {
    pub fn from_config(config: &EnvironmentsConfig) -> Self {
        Self {
            global: config.global.clone(),
            declared: config.declared.iter().map(|e| e.name.clone()).collect(),
            parents: config
                .declared
                .iter()
                .map(|e| (e.name.clone(), e.parent.clone()))
                .collect(),
        }
    }

    pub fn global(&self) -> &str {
        &self.global
    }

    pub fn is_global(&self, environment: &str) -> bool {
        environment == self.global
    }

    pub fn is_declared(&self, environment: &str) -> bool {
        self.parents.contains_key(environment)
    }

    pub fn declared(&self) -> &[String] {
        &self.declared
    }

    /// `environment` followed by its ancestors, nearest first. Empty for the
    /// global scope.
    pub fn chain(&self, environment: &str) -> Vec<String> {
        if self.is_global(environment) {
            return Vec::new();
        }
        let mut chain = vec![environment.to_string()];
        let mut current = environment;
        while let Some(Some(parent)) = self.parents.get(current) {
            if chain.iter().any(|c| c == parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }

    /// Declared environments that inherit from `environment`, directly or not.
    pub fn descendants(&self, environment: &str) -> Vec<String> {
        self.declared
            .iter()
            .filter(|name| name.as_str() != environment)
            .filter(|name| self.chain(name).iter().any(|c| c == environment))
            .cloned()
            .collect()
    }

    /// Environments whose resolved value a write at `environment` can change.
    /// The global scope affects every environment.
    pub fn affected_by(&self, environment: &str) -> Vec<String> {
        if self.is_global(environment) {
            let mut all = vec![self.global.clone()];
            all.extend(self.declared.iter().cloned());
            all
        } else {
            let mut affected = vec![environment.to_string()];
            affected.extend(self.descendants(environment));
            affected
        }
    }
}
