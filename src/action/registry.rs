//! Action registration and selection.

use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SelectionError};
use crate::graph::NodeKind;
use crate::planner::Diff;

use super::builtin::SharedOwnersAction;
use super::traits::Action;

/// Actions registered per node kind, in registration order.
#[derive(Clone)]
pub struct ActionRegistry {
    entries: Vec<(NodeKind, Arc<dyn Action>)>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(kind, action)| format!("{kind}:{}", action.name())))
            .finish()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    /// Creates a registry holding the built-in shared resource action.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![(NodeKind::SharedResource, Arc::new(SharedOwnersAction))],
        }
    }

    /// Creates a registry without built-in actions.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers an action for a node kind.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAction` if the name is taken for that kind.
    pub fn register(&mut self, kind: NodeKind, action: Arc<dyn Action>) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|(k, a)| *k == kind && a.name() == action.name())
        {
            return Err(SelectionError::DuplicateAction {
                action_name: action.name().to_string(),
            }
            .into());
        }
        debug!("Registered {kind} action {}", action.name());
        self.entries.push((kind, action));
        Ok(())
    }

    /// Returns every action accepting the diff, in registration order.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingAction` if nothing accepts the diff.
    pub fn select(&self, diff: &Diff) -> Result<Vec<Arc<dyn Action>>> {
        let selected: Vec<Arc<dyn Action>> = self
            .entries
            .iter()
            .filter(|(kind, action)| *kind == diff.kind() && action.filter(diff))
            .map(|(_, action)| Arc::clone(action))
            .collect();

        if selected.is_empty() {
            return Err(SelectionError::NoMatchingAction {
                context: diff.context().to_string(),
                action: diff.action().to_string(),
                field: diff.field().to_string(),
            }
            .into());
        }
        Ok(selected)
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
