//! Transaction state machine types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::planner::DiffMetadata;
use crate::serialization::Document;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Model diffs computed and actions selected.
    Diffed,
    /// Model actions built the desired resource graph.
    ModelActionsApplied,
    /// Resource diffs computed and actions selected.
    ResourceDiffed,
    /// Every resource action completed.
    ResourceActionsApplied,
    /// Snapshots persisted and lock released.
    Committed,
    /// A transition failed.
    Failed,
    /// The caller stopped the transaction.
    Aborted,
}

impl TransactionState {
    /// Returns true once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Diffed => "diffed",
            Self::ModelActionsApplied => "model_actions_applied",
            Self::ResourceDiffed => "resource_diffed",
            Self::ResourceActionsApplied => "resource_actions_applied",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The two action phases of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Model actions, building desired resources.
    Model,
    /// Resource actions, performing side effects.
    Resource,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

/// Position of the next resource diff to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Level index.
    pub level: usize,
    /// Diff index within the level.
    pub index: usize,
}

/// Where and why a transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePoint {
    /// Phase that failed, if the failure happened while applying actions.
    pub phase: Option<Phase>,
    /// Level being applied.
    pub level: usize,
    /// Index of the failing diff within the level.
    pub index: usize,
    /// Rendered error.
    pub message: String,
}

impl FailurePoint {
    /// Returns true if the transaction can continue with `resume`.
    #[must_use]
    pub const fn is_resumable(&self) -> bool {
        matches!(self.phase, Some(Phase::Resource))
    }
}

/// Serializable view of a transaction between transitions.
///
/// A checkpoint carries every graph the transaction built, so a failed
/// transaction can be restored by another process and resumed or rolled
/// back there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Transaction id.
    pub id: String,
    /// When the transaction began.
    pub started_at: DateTime<Utc>,
    /// Current state.
    pub state: TransactionState,
    /// Next resource diff to apply.
    pub cursor: Cursor,
    /// Failure details when `state` is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailurePoint>,
    /// Model diffs with their execution records.
    pub model_diffs: Vec<DiffMetadata>,
    /// Resource diffs with their execution records.
    pub resource_diffs: Vec<DiffMetadata>,
    /// Fingerprints of the persisted documents.
    pub fingerprints: BTreeMap<String, String>,
    /// Model graph being committed.
    #[serde(default)]
    pub models: Document,
    /// Model graph from the last commit.
    #[serde(default)]
    pub previous_models: Document,
    /// Resource graph from the last commit.
    #[serde(default)]
    pub previous_resources: Document,
    /// Desired resource graph built by model actions.
    #[serde(default)]
    pub desired_resources: Document,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(TransactionState::ResourceDiffed.to_string(), "resource_diffed");
        assert_eq!(
            serde_json::to_string(&TransactionState::ModelActionsApplied).unwrap(),
            "\"model_actions_applied\""
        );
        assert!(TransactionState::Committed.is_terminal());
        assert!(!TransactionState::Failed.is_terminal());
    }

    #[test]
    fn test_only_resource_failures_resume() {
        let mut failure = FailurePoint {
            phase: Some(Phase::Model),
            level: 0,
            index: 0,
            message: "boom".into(),
        };
        assert!(!failure.is_resumable());
        failure.phase = Some(Phase::Resource);
        assert!(failure.is_resumable());
    }
}
