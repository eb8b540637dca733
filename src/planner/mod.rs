//! Planning module for graph changes.
//!
//! This module compares a persisted snapshot with the current graph,
//! groups the resulting diffs into dependency levels, attaches the actions
//! that will apply them, and folds applied diffs back into the snapshot.

mod diff;
mod inverse;
mod level;
mod metadata;
mod plan;
mod types;

pub use diff::{DiffEngine, OWNERS_FIELD};
pub use inverse::{field_value, fold_into, ANCHORS_FIELD_PREFIX};
pub use level::level_diffs;
pub use metadata::DiffMetadata;
pub use plan::{ExecutionPlan, PlanSummary, PlannedDiff};
pub use types::{Diff, DiffAction};
