//! Diff types shared by the diff engine, actions and the transaction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::{Node, NodeKind};

/// Kind of change described by a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiffAction {
    /// The node or field is new.
    Add,
    /// The node or field is gone.
    Delete,
    /// The field changed in place.
    Update,
    /// The field changed and the object must be recreated.
    Replace,
}

impl DiffAction {
    /// Returns the persisted name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Delete => "DELETE",
            Self::Update => "UPDATE",
            Self::Replace => "REPLACE",
        }
    }
}

impl std::fmt::Display for DiffAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single change to one field of one node. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    context: String,
    class_name: String,
    node_type: String,
    package: String,
    kind: NodeKind,
    action: DiffAction,
    field: String,
    value: Value,
}

impl Diff {
    /// Creates a diff about `node`.
    #[must_use]
    pub fn new(node: &Node, action: DiffAction, field: impl Into<String>, value: Value) -> Self {
        Self {
            context: node.context().to_string(),
            class_name: node.class_name().to_string(),
            node_type: node.node_type().to_string(),
            package: node.package().to_string(),
            kind: node.kind(),
            action,
            field: field.into(),
            value,
        }
    }

    /// Context of the changed node.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Class discriminator of the changed node.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Type name of the changed node.
    #[must_use]
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Package of the changed node.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Node family of the changed node.
    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Kind of change.
    #[must_use]
    pub const fn action(&self) -> DiffAction {
        self.action
    }

    /// Changed field.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// New value (the identity for ADD and DELETE).
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }
}

impl std::fmt::Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} '{}'", self.action, self.context, self.field)
    }
}
