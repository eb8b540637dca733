//! Execution and audit record of a single diff.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::Diff;

/// A diff plus everything learned while applying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMetadata {
    /// The change being applied.
    pub diff: Diff,
    /// Names of the matched actions, in invocation order.
    pub actions: Vec<String>,
    /// Dependency level of the diff.
    pub level: usize,
    /// Whether every matched action completed.
    pub applied: bool,
    /// Position in the commit, assigned when applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_order: Option<u64>,
    /// Inputs captured for the actions.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Outputs produced by the actions.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl DiffMetadata {
    /// Wraps a diff that has not been applied yet.
    #[must_use]
    pub fn new(diff: Diff, actions: Vec<String>, level: usize) -> Self {
        Self {
            diff,
            actions,
            level,
            applied: false,
            apply_order: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Marks the diff as applied at the given position.
    pub fn mark_applied(&mut self, order: u64) {
        self.applied = true;
        self.apply_order = Some(order);
    }
}

impl std::fmt::Display for DiffMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.level, self.diff)?;
        if !self.actions.is_empty() {
            write!(f, " via {}", self.actions.join(", "))?;
        }
        Ok(())
    }
}
