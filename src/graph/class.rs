//! Node classes: per-type schema and diff hooks.
//!
//! Provider packages implement [`NodeClass`] for every model, resource and
//! overlay type they contribute. [`StaticClass`] covers the common case of a
//! type that only needs constraints and the default hooks.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::overlay::anchor_binding_diffs;
use crate::planner::{Diff, DiffAction};

use super::node::{Node, NodeKind};
use super::validation::FieldConstraint;

/// How a committed diff is folded into the persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverseStrategy {
    /// Copy the whole node from the desired graph.
    CopyNode,
    /// Drop the node from the snapshot.
    DropNode,
    /// Copy the changed field and the observed response.
    CopyField,
    /// Copy every property and the response onto the existing node.
    CloneInPlace,
    /// Leave the snapshot untouched.
    Skip,
}

impl InverseStrategy {
    /// Default strategy for a diff action.
    #[must_use]
    pub const fn for_action(action: DiffAction) -> Self {
        match action {
            DiffAction::Add => Self::CopyNode,
            DiffAction::Delete => Self::DropNode,
            DiffAction::Update | DiffAction::Replace => Self::CopyField,
        }
    }
}

/// Schema and diff hooks of a node type.
pub trait NodeClass: Send + Sync + std::fmt::Debug {
    /// Type name, e.g. `region`.
    fn node_type(&self) -> &str;

    /// Package namespace, e.g. `@example`.
    fn package(&self) -> &str;

    /// Node family of every instance.
    fn kind(&self) -> NodeKind;

    /// Property holding the identity value.
    fn identity_field(&self) -> &str;

    /// Discriminator used by the class registry and persisted documents.
    fn class_name(&self) -> String {
        format!("{}/{}", self.package(), self.node_type())
    }

    /// Constraints checked on every property mutation.
    fn constraints(&self) -> &[FieldConstraint] {
        &[]
    }

    /// Fields whose change requires replacing the underlying object.
    fn replace_fields(&self) -> &[String] {
        &[]
    }

    /// Expands the ADD diff of a new node.
    fn unpack(&self, diff: Diff, _node: &Node) -> Vec<Diff> {
        vec![diff]
    }

    /// Compares the properties of a node present in both graphs.
    fn diff_properties(&self, previous: &Node, current: &Node) -> Vec<Diff> {
        property_diffs(previous, current, self.replace_fields())
    }

    /// Compares anchors and overlay bindings of a node present in both graphs.
    fn diff_anchors(&self, _previous: &Node, _current: &Node) -> Vec<Diff> {
        Vec::new()
    }

    /// Describes how a committed diff updates the persisted snapshot.
    fn inverse(&self, diff: &Diff) -> InverseStrategy {
        InverseStrategy::for_action(diff.action())
    }
}

/// Default property comparison: deep equality per key over the union of keys.
///
/// Emits UPDATE per changed field, or REPLACE for fields listed in
/// `replace_fields`. Removed fields are reported with a null value.
#[must_use]
pub fn property_diffs(previous: &Node, current: &Node, replace_fields: &[String]) -> Vec<Diff> {
    let keys: BTreeSet<&String> = previous
        .properties()
        .keys()
        .chain(current.properties().keys())
        .collect();

    keys.into_iter()
        .filter(|key| key.as_str() != current.identity_field())
        .filter_map(|key| {
            let before = previous.property(key);
            let after = current.property(key);
            if before == after {
                return None;
            }
            let action = if replace_fields.iter().any(|f| f == key) {
                DiffAction::Replace
            } else {
                DiffAction::Update
            };
            Some(Diff::new(
                current,
                action,
                key.clone(),
                after.cloned().unwrap_or(Value::Null),
            ))
        })
        .collect()
}

/// A class configured entirely from data.
#[derive(Debug, Clone)]
pub struct StaticClass {
    package: String,
    node_type: String,
    kind: NodeKind,
    identity_field: String,
    constraints: Vec<FieldConstraint>,
    replace_fields: Vec<String>,
    inverse: Option<InverseStrategy>,
}

impl StaticClass {
    /// Creates a class of the given kind.
    #[must_use]
    pub fn new(
        package: impl Into<String>,
        node_type: impl Into<String>,
        kind: NodeKind,
        identity_field: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            node_type: node_type.into(),
            kind,
            identity_field: identity_field.into(),
            constraints: Vec::new(),
            replace_fields: Vec::new(),
            inverse: None,
        }
    }

    /// Creates a model class.
    #[must_use]
    pub fn model(package: &str, node_type: &str, identity_field: &str) -> Self {
        Self::new(package, node_type, NodeKind::Model, identity_field)
    }

    /// Creates a resource class.
    #[must_use]
    pub fn resource(package: &str, node_type: &str, identity_field: &str) -> Self {
        Self::new(package, node_type, NodeKind::Resource, identity_field)
    }

    /// Creates an overlay class.
    #[must_use]
    pub fn overlay(package: &str, node_type: &str, identity_field: &str) -> Self {
        Self::new(package, node_type, NodeKind::Overlay, identity_field)
    }

    /// Creates a shared resource class.
    #[must_use]
    pub fn shared(package: &str, node_type: &str, identity_field: &str) -> Self {
        Self::new(package, node_type, NodeKind::SharedResource, identity_field)
    }

    /// Adds a property constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: FieldConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Marks a field as requiring replacement when it changes.
    #[must_use]
    pub fn replace_field(mut self, field: impl Into<String>) -> Self {
        self.replace_fields.push(field.into());
        self
    }

    /// Overrides the inverse strategy for every diff of this class.
    #[must_use]
    pub const fn inverse_strategy(mut self, strategy: InverseStrategy) -> Self {
        self.inverse = Some(strategy);
        self
    }
}

impl NodeClass for StaticClass {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn package(&self) -> &str {
        &self.package
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn identity_field(&self) -> &str {
        &self.identity_field
    }

    fn constraints(&self) -> &[FieldConstraint] {
        &self.constraints
    }

    fn replace_fields(&self) -> &[String] {
        &self.replace_fields
    }

    fn diff_anchors(&self, previous: &Node, current: &Node) -> Vec<Diff> {
        if self.kind == NodeKind::Overlay {
            anchor_binding_diffs(previous, current)
        } else {
            Vec::new()
        }
    }

    fn inverse(&self, diff: &Diff) -> InverseStrategy {
        // Structural changes always copy or drop the whole node.
        match (self.inverse, diff.action()) {
            (Some(strategy), DiffAction::Update | DiffAction::Replace) => strategy,
            _ => InverseStrategy::for_action(diff.action()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;
    use serde_json::json;

    fn region(class: &StaticClass, props: Value) -> Node {
        let mut node = Node::blank(NodeId(1), class, "r1", String::from("region=r1,app=t"));
        node.properties = props.as_object().cloned().unwrap_or_default();
        node
    }

    #[test]
    fn test_class_name() {
        let class = StaticClass::model("@example", "region", "regionId");
        assert_eq!(class.class_name(), "@example/region");
        assert_eq!(class.kind(), NodeKind::Model);
    }

    #[test]
    fn test_property_diffs() {
        let class = StaticClass::model("@example", "region", "regionId").replace_field("zone");
        let before = region(&class, json!({"regionId": "r1", "size": 1, "zone": "a", "old": true}));
        let after = region(&class, json!({"regionId": "r1", "size": 2, "zone": "b"}));

        let diffs = class.diff_properties(&before, &after);
        let summary: Vec<_> = diffs
            .iter()
            .map(|d| (d.field().to_string(), d.action()))
            .collect();

        assert_eq!(
            summary,
            vec![
                (String::from("old"), DiffAction::Update),
                (String::from("size"), DiffAction::Update),
                (String::from("zone"), DiffAction::Replace),
            ]
        );
        assert_eq!(diffs[0].value(), &Value::Null);
    }

    #[test]
    fn test_equal_nodes_have_no_diffs() {
        let class = StaticClass::model("@example", "region", "regionId");
        let node = region(&class, json!({"regionId": "r1", "tags": {"a": [1, 2]}}));
        assert!(class.diff_properties(&node, &node.clone()).is_empty());
    }

    #[test]
    fn test_inverse_override() {
        let class = StaticClass::resource("@example", "vpc", "vpcId")
            .inverse_strategy(InverseStrategy::CloneInPlace);
        let node = Node::blank(NodeId(0), &class, "v", String::from("@example/vpc=v"));

        let update = Diff::new(&node, DiffAction::Update, "cidr", json!("10.0.0.0/16"));
        let add = Diff::new(&node, DiffAction::Add, "vpcId", json!("v"));
        assert_eq!(class.inverse(&update), InverseStrategy::CloneInPlace);
        assert_eq!(class.inverse(&add), InverseStrategy::CopyNode);
    }
}
