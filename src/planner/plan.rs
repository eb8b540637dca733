//! Execution plans: leveled diffs with their selected actions.

use serde::Serialize;
use std::sync::Arc;

use crate::action::{Action, ActionRegistry};
use crate::error::{Result, TransactionError};

use super::metadata::DiffMetadata;
use super::types::{Diff, DiffAction};

/// A diff scheduled for execution.
#[derive(Clone)]
pub struct PlannedDiff {
    /// Execution record.
    pub metadata: DiffMetadata,
    /// Selected actions in registration order.
    pub actions: Vec<Arc<dyn Action>>,
}

/// Counts of planned changes per diff action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Number of ADD diffs.
    pub adds: usize,
    /// Number of UPDATE diffs.
    pub updates: usize,
    /// Number of REPLACE diffs.
    pub replaces: usize,
    /// Number of DELETE diffs.
    pub deletes: usize,
}

/// Leveled diffs ready to be applied level by level.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    levels: Vec<Vec<PlannedDiff>>,
}

impl std::fmt::Debug for PlannedDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedDiff")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl ExecutionPlan {
    /// Selects actions for every diff.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingAction` if a diff has no action.
    pub fn build(levels: Vec<Vec<Diff>>, registry: &ActionRegistry) -> Result<Self> {
        let levels = levels
            .into_iter()
            .enumerate()
            .map(|(level, diffs)| {
                diffs
                    .into_iter()
                    .map(|diff| {
                        let actions = registry.select(&diff)?;
                        let names = actions.iter().map(|a| a.name().to_string()).collect();
                        Ok(PlannedDiff {
                            metadata: DiffMetadata::new(diff, names, level),
                            actions,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { levels })
    }

    /// Rebuilds a plan from saved execution records, selecting the actions
    /// again. Records keep their applied flags, inputs and outputs.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingAction` if a diff has no action, or
    /// `ActionsChanged` if the selected actions differ from the recorded
    /// ones.
    pub fn restore(records: Vec<DiffMetadata>, registry: &ActionRegistry) -> Result<Self> {
        let mut levels: Vec<Vec<PlannedDiff>> = Vec::new();
        for metadata in records {
            let actions = registry.select(&metadata.diff)?;
            let selected: Vec<String> = actions.iter().map(|a| a.name().to_string()).collect();
            if selected != metadata.actions {
                return Err(TransactionError::ActionsChanged {
                    context: metadata.diff.context().to_string(),
                    recorded: metadata.actions.join(", "),
                    selected: selected.join(", "),
                }
                .into());
            }
            if levels.len() <= metadata.level {
                levels.resize_with(metadata.level + 1, Vec::new);
            }
            levels[metadata.level].push(PlannedDiff { metadata, actions });
        }
        Ok(Self { levels })
    }

    /// Planned levels.
    #[must_use]
    pub fn levels(&self) -> &[Vec<PlannedDiff>] {
        &self.levels
    }

    pub(crate) fn levels_mut(&mut self) -> &mut [Vec<PlannedDiff>] {
        &mut self.levels
    }

    /// Number of levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Total number of diffs.
    #[must_use]
    pub fn diff_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diff_count() == 0
    }

    /// Execution records in level order.
    pub fn metadata(&self) -> impl Iterator<Item = &DiffMetadata> {
        self.levels.iter().flatten().map(|planned| &planned.metadata)
    }

    /// Counts diffs per action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for metadata in self.metadata() {
            match metadata.diff.action() {
                DiffAction::Add => summary.adds += 1,
                DiffAction::Update => summary.updates += 1,
                DiffAction::Replace => summary.replaces += 1,
                DiffAction::Delete => summary.deletes += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to update, {} to replace, {} to delete",
            self.adds, self.updates, self.replaces, self.deletes
        )
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} diffs, {} levels):", self.diff_count(), self.level_count())?;
        for (level, diffs) in self.levels.iter().enumerate() {
            writeln!(f, "  Level {level}:")?;
            for planned in diffs {
                writeln!(f, "    - {}", planned.metadata)?;
            }
        }
        write!(f, "{}", self.summary())
    }
}
