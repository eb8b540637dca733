//! Node entity shared by models, resources, overlays and shared resources.
//!
//! A node is plain data. Every mutation goes through [`Graph`](super::Graph)
//! so that class constraints and structural invariants are checked once per
//! change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::overlay::{AnchorSlot, SlotBinding};

use super::anchor::Anchor;
use super::class::NodeClass;
use super::dependency::{Dependency, Relationship};

/// Position of a node in its graph. Ids grow with creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u64);

/// The family a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Provider-agnostic desired infrastructure.
    Model,
    /// A concrete provider object.
    Resource,
    /// A composite node binding anchors of other nodes.
    Overlay,
    /// A resource referenced by several independent owners.
    SharedResource,
}

impl NodeKind {
    /// Returns true for resources and shared resources.
    #[must_use]
    pub const fn is_resource(self) -> bool {
        matches!(self, Self::Resource | Self::SharedResource)
    }

    /// Returns the persisted name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Resource => "resource",
            Self::Overlay => "overlay",
            Self::SharedResource => "shared_resource",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl NodeId {
    /// Returns the raw creation sequence number.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

/// A graph entity with a unique context address.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) class_name: String,
    pub(crate) node_type: String,
    pub(crate) package: String,
    pub(crate) kind: NodeKind,
    pub(crate) identity_field: String,
    pub(crate) identity: String,
    pub(crate) context: String,
    pub(crate) properties: Map<String, Value>,
    pub(crate) response: Map<String, Value>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) anchors: Vec<Anchor>,
    pub(crate) slots: Vec<AnchorSlot>,
    pub(crate) bindings: Vec<SlotBinding>,
    pub(crate) owners: BTreeSet<String>,
    pub(crate) dirty: bool,
}

impl Node {
    /// Creates an unpopulated node. Used by the graph and the deserializer.
    pub(crate) fn blank(id: NodeId, class: &dyn NodeClass, identity: &str, context: String) -> Self {
        Self {
            id,
            class_name: class.class_name(),
            node_type: class.node_type().to_string(),
            package: class.package().to_string(),
            kind: class.kind(),
            identity_field: class.identity_field().to_string(),
            identity: identity.to_string(),
            context,
            properties: Map::new(),
            response: Map::new(),
            dependencies: Vec::new(),
            anchors: Vec::new(),
            slots: Vec::new(),
            bindings: Vec::new(),
            owners: BTreeSet::new(),
            dirty: false,
        }
    }

    /// Graph position of this node.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Class discriminator (`<package>/<type>`).
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Type name, e.g. `region`.
    #[must_use]
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Package namespace, e.g. `@example`.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Node family.
    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Name of the identifying property.
    #[must_use]
    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    /// Value of the identifying property.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Unique context address.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Declared (desired) properties.
    #[must_use]
    pub const fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Looks up a single property.
    #[must_use]
    pub fn property(&self, field: &str) -> Option<&Value> {
        self.properties.get(field)
    }

    /// Observed state reported by resource actions.
    #[must_use]
    pub const fn response(&self) -> &Map<String, Value> {
        &self.response
    }

    /// Outgoing dependency edges in insertion order.
    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Returns the edge from this node to `to`, if any.
    #[must_use]
    pub fn dependency_to(&self, to: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.to() == to)
    }

    /// Contexts this node must outlive: children and overlays bound to it.
    pub fn dependents(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| {
                matches!(
                    d.relationship(),
                    Some(Relationship::Child | Relationship::Binding)
                )
            })
            .map(Dependency::to)
    }

    /// Contexts of the parents of this node.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.relationship() == Some(Relationship::Parent))
            .map(Dependency::to)
    }

    /// Anchors owned by this node.
    #[must_use]
    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Looks up an anchor by id.
    #[must_use]
    pub fn anchor(&self, anchor_id: &str) -> Option<&Anchor> {
        self.anchors.iter().find(|a| a.anchor_id() == anchor_id)
    }

    /// Declared overlay slots (empty for non-overlays).
    #[must_use]
    pub fn slots(&self) -> &[AnchorSlot] {
        &self.slots
    }

    /// Slot resolutions recorded by the last binding pass.
    #[must_use]
    pub fn bindings(&self) -> &[SlotBinding] {
        &self.bindings
    }

    /// Owner contexts of a shared resource.
    #[must_use]
    pub const fn owners(&self) -> &BTreeSet<String> {
        &self.owners
    }

    /// True when a resource action ran in a level that did not complete.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns properties and response as one JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "context": self.context,
            "properties": self.properties,
            "response": self.response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StaticClass;

    #[test]
    fn test_kind_families() {
        assert!(NodeKind::Resource.is_resource());
        assert!(NodeKind::SharedResource.is_resource());
        assert!(!NodeKind::Model.is_resource());
        assert!(!NodeKind::Overlay.is_resource());
        assert_eq!(NodeKind::SharedResource.to_string(), "shared_resource");
    }

    #[test]
    fn test_dependents_and_parents() {
        let class = StaticClass::model("@example", "region", "regionId");
        let mut node = Node::blank(NodeId(0), &class, "r1", String::from("region=r1,app=t"));
        assert_eq!(node.class_name(), "@example/region");
        node.dependencies.push(
            Dependency::new("region=r1,app=t", "app=t").with_relationship(Relationship::Parent),
        );
        node.dependencies.push(
            Dependency::new("region=r1,app=t", "environment=qa,region=r1,app=t")
                .with_relationship(Relationship::Child),
        );

        assert_eq!(node.parents().collect::<Vec<_>>(), vec!["app=t"]);
        assert_eq!(
            node.dependents().collect::<Vec<_>>(),
            vec!["environment=qa,region=r1,app=t"]
        );
        assert!(node.dependency_to("app=t").is_some());
    }
}
