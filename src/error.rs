//! Error types for the Keystone engine.
//!
//! This module provides the error hierarchy for every stage of a commit:
//! graph mutation, dependency rules, action selection, the transaction
//! state machine, serialization and the external state store.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Keystone engine.
#[derive(Debug, Error)]
pub enum KeystoneError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A node mutation violated its class constraints.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The graph structure would become inconsistent.
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    /// A dependency rule is malformed or cannot be ordered.
    #[error("Behavior error: {0}")]
    Behavior(#[from] BehaviorError),

    /// A diff could not be matched to actions or inputs.
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// The transaction could not proceed.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// An action reported a failure.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Graph document conversion errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// A node property violated a declared constraint.
#[derive(Debug, Error)]
#[error("{context}: field '{field}' {message}")]
pub struct ValidationError {
    /// Context address of the node being mutated.
    pub context: String,
    /// Field that failed validation.
    pub field: String,
    /// Description of the violated constraint.
    pub message: String,
}

/// Errors that would leave the graph in an inconsistent shape.
#[derive(Debug, Error)]
pub enum StructuralError {
    /// Two live nodes would share the same context.
    #[error("Node already exists: {context}")]
    DuplicateNode {
        /// The duplicated context.
        context: String,
    },

    /// A node was referenced that is not in the graph.
    #[error("Node not found: {context}")]
    NodeNotFound {
        /// The missing context.
        context: String,
    },

    /// A second edge between the same ordered pair of nodes.
    #[error("Dependency already exists from {from} to {to}")]
    DuplicateDependency {
        /// Source node context.
        from: String,
        /// Target node context.
        to: String,
    },

    /// An anchor with the same id is already attached to the node.
    #[error("Anchor '{anchor_id}' already exists on {parent}")]
    DuplicateAnchor {
        /// Anchor identifier.
        anchor_id: String,
        /// Context of the owning node.
        parent: String,
    },

    /// The node still has live dependents.
    #[error("Cannot remove {context}: dependents still exist ({})", .dependents.join(", "))]
    RemovalConflict {
        /// Context of the node being removed.
        context: String,
        /// Contexts of the live dependents.
        dependents: Vec<String>,
    },

    /// The class discriminator is not registered.
    #[error("Unknown node class: {class_name}")]
    UnknownClass {
        /// The unregistered discriminator.
        class_name: String,
    },

    /// The class discriminator is registered twice.
    #[error("Node class already registered: {class_name}")]
    DuplicateClass {
        /// The duplicated discriminator.
        class_name: String,
    },

    /// The operation does not apply to this kind of node.
    #[error("{context} is a {kind} node, expected {expected}")]
    WrongKind {
        /// Node context.
        context: String,
        /// Actual node kind.
        kind: String,
        /// Expected node kind.
        expected: String,
    },

    /// An overlay slot could not be resolved to an anchor.
    #[error("Overlay {overlay}: slot '{slot}' matched no anchor")]
    AnchorNotFound {
        /// Overlay context.
        overlay: String,
        /// Slot name.
        slot: String,
    },

    /// A single-anchor overlay slot matched more than one anchor.
    #[error("Overlay {overlay}: slot '{slot}' is ambiguous ({})", .matches.join(", "))]
    AnchorAmbiguous {
        /// Overlay context.
        overlay: String,
        /// Slot name.
        slot: String,
        /// Matching anchor references.
        matches: Vec<String>,
    },
}

/// Malformed or unsatisfiable dependency rules.
#[derive(Debug, Error)]
pub enum BehaviorError {
    /// The behavior definition itself is invalid.
    #[error("Malformed behavior on {from} -> {to}: {reason}")]
    Malformed {
        /// Source node context.
        from: String,
        /// Target node context.
        to: String,
        /// Why the behavior was rejected.
        reason: String,
    },

    /// The behaviors form a cycle between diffs.
    #[error("Circular dependency between diffs: {cycle}")]
    CircularDependency {
        /// Description of the diffs involved.
        cycle: String,
    },
}

/// Errors raised while matching diffs to actions.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// No registered action accepts the diff.
    #[error("No action matches {action} '{field}' on {context}")]
    NoMatchingAction {
        /// Node context.
        context: String,
        /// Diff action.
        action: String,
        /// Diff field.
        field: String,
    },

    /// An input requested by an action was never produced.
    #[error("Action '{action_name}' on {context}: unresolved input '{input}'")]
    UnresolvedInput {
        /// Name of the requesting action.
        action_name: String,
        /// Node context of the diff.
        context: String,
        /// The input key that could not be resolved.
        input: String,
    },

    /// An action was registered twice for the same node kind.
    #[error("Action already registered: {action_name}")]
    DuplicateAction {
        /// Name of the action.
        action_name: String,
    },
}

/// Transaction state machine errors.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Resources from the previous snapshot were left partially applied.
    #[error("Dirty resources in previous snapshot: {}", .contexts.join(", "))]
    DirtyResources {
        /// Contexts of the dirty resources.
        contexts: Vec<String>,
    },

    /// The requested operation is not valid in the current state.
    #[error("Cannot {operation} while transaction is {state}")]
    InvalidState {
        /// Operation attempted.
        operation: String,
        /// Current transaction state.
        state: String,
    },

    /// An action failed during a phase.
    #[error("Action '{action_name}' failed on {action} '{field}' of {context} (level {level}): {source}")]
    ActionFailed {
        /// Name of the failing action.
        action_name: String,
        /// Node context of the diff.
        context: String,
        /// Diff action.
        action: String,
        /// Diff field.
        field: String,
        /// Level being applied.
        level: usize,
        /// Underlying error.
        #[source]
        source: Box<KeystoneError>,
    },

    /// A transaction hook rejected the transition.
    #[error("Hook '{hook}' failed during {stage}: {source}")]
    HookFailed {
        /// Hook name.
        hook: String,
        /// Stage that ran the hook.
        stage: String,
        /// Underlying error.
        #[source]
        source: Box<KeystoneError>,
    },

    /// The persisted snapshot changed under a paused transaction.
    #[error("Snapshot '{name}' changed since the transaction started (expected {expected}, found {found})")]
    SnapshotChanged {
        /// State document name.
        name: String,
        /// Fingerprint recorded at begin.
        expected: String,
        /// Fingerprint found now.
        found: String,
    },

    /// Restored diffs no longer select the actions they were applied with.
    #[error("Actions for '{context}' changed: recorded [{recorded}], selected [{selected}]")]
    ActionsChanged {
        /// Context of the diff.
        context: String,
        /// Action names saved with the diff.
        recorded: String,
        /// Action names selected now.
        selected: String,
    },

    /// The app lock expired or was taken over while the transaction ran.
    #[error("Lock {lock_id} was lost while the transaction was running")]
    LockLost {
        /// Lock id held by the transaction.
        lock_id: String,
    },
}

/// Error reported by an action implementation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActionError {
    /// Description of the failure.
    pub message: String,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// No state was saved under this name.
    #[error("No state found: {name}")]
    NoState {
        /// State document name.
        name: String,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("App is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock id does not match the current lock.
    #[error("Lock {lock_id} is not held")]
    LockNotHeld {
        /// The lock id presented.
        lock_id: String,
    },

    /// Backend storage error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Graph document conversion errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON encoding or decoding failed.
    #[error("Invalid {document} document: {message}")]
    Json {
        /// Name of the document.
        document: String,
        /// Description of the failure.
        message: String,
    },

    /// A dependency points at a context absent from the document.
    #[error("{context} references unknown node {target}")]
    DanglingReference {
        /// Context of the referencing node.
        context: String,
        /// Missing target context.
        target: String,
    },

    /// The payload disagrees with the registered class.
    #[error("Entry {context} does not match class {class_name}: {message}")]
    ClassMismatch {
        /// Entry context.
        context: String,
        /// Registered discriminator.
        class_name: String,
        /// Description of the mismatch.
        message: String,
    },
}

/// Result type alias for Keystone operations.
pub type Result<T> = std::result::Result<T, KeystoneError>;

impl KeystoneError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::LockFailed { .. } | StateError::LockedByOther { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::State(StateError::LockFailed { .. }) => Some(2),
            Self::State(StateError::LockedByOther { .. }) => Some(30),
            _ => None,
        }
    }

    /// Returns the context address of the node the error is about, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::Validation(e) => Some(&e.context),
            Self::Structural(
                StructuralError::DuplicateNode { context }
                | StructuralError::NodeNotFound { context }
                | StructuralError::RemovalConflict { context, .. }
                | StructuralError::WrongKind { context, .. },
            ) => Some(context),
            Self::Selection(
                SelectionError::NoMatchingAction { context, .. }
                | SelectionError::UnresolvedInput { context, .. },
            ) => Some(context),
            Self::Transaction(TransactionError::ActionFailed { context, .. }) => Some(context),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ValidationError {
    /// Creates a validation error for a node field.
    #[must_use]
    pub fn new(
        context: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl ActionError {
    /// Creates an action error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a backend error for a failed filesystem operation.
    #[must_use]
    pub fn io(operation: &str, path: &std::path::Path, source: &std::io::Error) -> Self {
        Self::backend(format!("Failed to {operation} {}: {source}", path.display()))
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl SerializationError {
    /// Creates a JSON error for the named document.
    #[must_use]
    pub fn json(document: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Json {
            document: document.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_are_retryable() {
        let err = KeystoneError::State(StateError::LockedByOther {
            holder: String::from("host-1"),
            since: String::from("now"),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(30));

        let err = KeystoneError::State(StateError::NoState {
            name: String::from("models.json"),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_context() {
        let err = KeystoneError::Structural(StructuralError::RemovalConflict {
            context: String::from("region=r1,app=t"),
            dependents: vec![String::from("environment=qa,region=r1,app=t")],
        });
        assert_eq!(err.context(), Some("region=r1,app=t"));
        assert!(err.to_string().contains("environment=qa"));
    }
}
