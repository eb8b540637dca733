//! The node arena and its validated mutators.
//!
//! Nodes live in a map keyed by [`NodeId`] and are addressed by context
//! through a secondary index. Every public mutator validates first and
//! touches the arena last, so a rejected call leaves the graph unchanged.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{
    BehaviorError, KeystoneError, Result, StructuralError, ValidationError,
};
use crate::overlay::{AnchorSlot, SlotBinding};
use crate::planner::DiffAction;
use crate::serialization::ClassRegistry;

use super::anchor::Anchor;
use super::context::{derive_context, identity_problem};
use super::dependency::{Behavior, Dependency, Relationship};
use super::node::{Node, NodeId, NodeKind};
use super::validation::{validate_change, validate_properties};

/// Declarative description of a node to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    class_name: String,
    identity: String,
    properties: Map<String, Value>,
}

impl NodeSpec {
    /// Starts a spec for the given class and identity value.
    #[must_use]
    pub fn new(class_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            identity: identity.into(),
            properties: Map::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn property(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(field.into(), value.into());
        self
    }

    /// Adds every property of a JSON object. Non-objects are ignored.
    #[must_use]
    pub fn properties(mut self, value: Value) -> Self {
        if let Value::Object(map) = value {
            self.properties.extend(map);
        }
        self
    }
}

/// A graph of nodes of one family (models, or resources).
#[derive(Debug, Clone)]
pub struct Graph {
    classes: Arc<ClassRegistry>,
    nodes: BTreeMap<NodeId, Node>,
    index: HashMap<String, NodeId>,
    next_id: u64,
}

impl Graph {
    /// Creates an empty graph using the given class registry.
    #[must_use]
    pub fn new(classes: Arc<ClassRegistry>) -> Self {
        Self {
            classes,
            nodes: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registered classes.
    #[must_use]
    pub const fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Looks up a node by context.
    #[must_use]
    pub fn find(&self, context: &str) -> Option<&Node> {
        self.index.get(context).and_then(|id| self.nodes.get(id))
    }

    /// Returns the id of the node with this context.
    #[must_use]
    pub fn id_of(&self, context: &str) -> Option<NodeId> {
        self.index.get(context).copied()
    }

    /// Returns true if a node with this context exists.
    #[must_use]
    pub fn contains(&self, context: &str) -> bool {
        self.index.contains_key(context)
    }

    /// Looks up a node by id, failing if it is absent.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the id is not in the graph.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or_else(|| missing_id(id))
    }

    /// Resolves a context to its node, failing on dangling references.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if no node has this context.
    pub fn dereference(&self, context: &str) -> Result<&Node> {
        self.find(context).ok_or_else(|| {
            StructuralError::NodeNotFound {
                context: context.to_string(),
            }
            .into()
        })
    }

    /// Creates a root node.
    ///
    /// # Errors
    ///
    /// Returns an error if the class is unknown, the identity is invalid,
    /// the context is taken, or a property violates a class constraint.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let node = self.prepare(spec, None)?;
        Ok(self.attach(node))
    }

    /// Creates a node as the child of `parent`.
    ///
    /// Adds `parent -> child` with `(parentId, ADD) -> (childId, ADD)` and
    /// `child -> parent` with `(childId, DELETE) -> (parentId, DELETE)`.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Graph::add_node`], or `NodeNotFound` if
    /// the parent is absent.
    pub fn add_child(&mut self, parent: NodeId, spec: NodeSpec) -> Result<NodeId> {
        let parent_context = self.node(parent)?.context().to_string();
        let node = self.prepare(spec, Some(&parent_context))?;
        let child = self.attach(node);
        self.connect_child(parent, child);
        Ok(child)
    }

    /// Creates the parent/child edge pair between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if either node is absent or an edge already exists.
    pub fn link_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let parent_node = self.node(parent)?;
        let child_node = self.node(child)?;
        if parent == child {
            return Err(self_edge(parent_node.context()));
        }
        for (from, to) in [(parent_node, child_node), (child_node, parent_node)] {
            if from.dependency_to(to.context()).is_some() {
                return Err(StructuralError::DuplicateDependency {
                    from: from.context().to_string(),
                    to: to.context().to_string(),
                }
                .into());
            }
        }
        self.connect_child(parent, child);
        Ok(())
    }

    /// Returns the existing node for this spec or creates it.
    ///
    /// Properties in `spec` are applied to an existing node through
    /// [`Graph::set_property`].
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Graph::add_node`] and
    /// [`Graph::set_property`].
    pub fn ensure_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let class = self.classes.class(&spec.class_name)?;
        let context = derive_context(
            class.kind(),
            class.package(),
            class.node_type(),
            &spec.identity,
            None,
        );
        match self.id_of(&context) {
            Some(id) => {
                for (field, value) in spec.properties {
                    self.set_property(id, &field, value)?;
                }
                Ok(id)
            }
            None => self.add_node(spec),
        }
    }

    /// Sets a property after checking class constraints.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the identity field would change or a
    /// constraint fails.
    pub fn set_property(&mut self, id: NodeId, field: &str, value: Value) -> Result<()> {
        let node = self.node(id)?;
        if field == node.identity_field() && value.as_str() != Some(node.identity()) {
            return Err(ValidationError::new(node.context(), field, "identity cannot change").into());
        }
        let class = self.classes.class(node.class_name())?;
        validate_change(
            node.context(),
            class.constraints(),
            field,
            node.property(field),
            Some(&value),
        )?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.properties.insert(field.to_string(), value);
        }
        Ok(())
    }

    /// Removes a property after checking class constraints.
    ///
    /// # Errors
    ///
    /// Returns a validation error for the identity field or a required field.
    pub fn remove_property(&mut self, id: NodeId, field: &str) -> Result<Option<Value>> {
        let node = self.node(id)?;
        if field == node.identity_field() {
            return Err(ValidationError::new(node.context(), field, "identity cannot be removed").into());
        }
        let class = self.classes.class(node.class_name())?;
        validate_change(node.context(), class.constraints(), field, node.property(field), None)?;
        Ok(self
            .nodes
            .get_mut(&id)
            .and_then(|node| node.properties.remove(field)))
    }

    /// Records one observed field of a resource.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` for model and overlay nodes.
    pub fn set_response(&mut self, id: NodeId, field: &str, value: Value) -> Result<()> {
        let node = self.node(id)?;
        if !node.kind().is_resource() {
            return Err(wrong_kind(node, "resource"));
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.response.insert(field.to_string(), value);
        }
        Ok(())
    }

    /// Adds an edge without behaviors.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateDependency` if the edge exists and a behavior error
    /// for self edges.
    pub fn add_dependency(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let from_node = self.node(from)?;
        let to_context = self.node(to)?.context().to_string();
        if from == to {
            return Err(self_edge(from_node.context()));
        }
        if from_node.dependency_to(&to_context).is_some() {
            return Err(StructuralError::DuplicateDependency {
                from: from_node.context().to_string(),
                to: to_context,
            }
            .into());
        }
        let from_context = from_node.context().to_string();
        if let Some(node) = self.nodes.get_mut(&from) {
            node.dependencies.push(Dependency::new(from_context, to_context));
        }
        Ok(())
    }

    /// Registers a behavior, creating the edge if needed.
    ///
    /// Returns false if an identical behavior was already registered.
    ///
    /// # Errors
    ///
    /// Returns a behavior error for malformed rules or self edges.
    pub fn add_behavior(&mut self, from: NodeId, to: NodeId, behavior: Behavior) -> Result<bool> {
        let from_context = self.node(from)?.context().to_string();
        let to_context = self.node(to)?.context().to_string();
        if from == to {
            return Err(self_edge(&from_context));
        }
        behavior.check(&from_context, &to_context)?;
        Ok(self
            .ensure_dependency(&from_context, &to_context, None)
            .is_some_and(|dependency| dependency.add_behavior(behavior)))
    }

    /// Checks for a behavior on the edge `from -> to` by exact 4-tuple.
    #[must_use]
    pub fn has_matching_behavior(
        &self,
        from: &str,
        to: &str,
        on: (&str, DiffAction),
        then: (&str, DiffAction),
    ) -> bool {
        self.find(from)
            .and_then(|node| node.dependency_to(to))
            .is_some_and(|dep| dep.has_matching_behavior(on.0, on.1, then.0, then.1))
    }

    /// Attaches an anchor to a node.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAnchor` if the node already has this anchor id.
    pub fn add_anchor(&mut self, id: NodeId, mut anchor: Anchor) -> Result<()> {
        let node = self.node(id)?;
        if node.anchor(anchor.anchor_id()).is_some() {
            return Err(StructuralError::DuplicateAnchor {
                anchor_id: anchor.anchor_id().to_string(),
                parent: node.context().to_string(),
            }
            .into());
        }
        anchor.attach(node.context());
        if let Some(node) = self.nodes.get_mut(&id) {
            node.anchors.push(anchor);
        }
        Ok(())
    }

    /// Creates an overlay node with its anchor slots.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the class is not an overlay class, a
    /// validation error for duplicate slot names, or any error of
    /// [`Graph::add_node`].
    pub fn add_overlay(&mut self, spec: NodeSpec, slots: Vec<AnchorSlot>) -> Result<NodeId> {
        let mut node = self.prepare(spec, None)?;
        if node.kind() != NodeKind::Overlay {
            return Err(wrong_kind(&node, NodeKind::Overlay.as_str()));
        }
        for (position, slot) in slots.iter().enumerate() {
            if slots[..position].iter().any(|s| s.name() == slot.name()) {
                return Err(ValidationError::new(
                    node.context(),
                    "slots",
                    format!("duplicate slot '{}'", slot.name()),
                )
                .into());
            }
        }
        node.slots = slots;
        Ok(self.attach(node))
    }

    /// Adds an owner to a shared resource.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` for anything but shared resources.
    pub fn share(&mut self, resource: NodeId, owner: &str) -> Result<()> {
        let node = self.node(resource)?;
        if node.kind() != NodeKind::SharedResource {
            return Err(wrong_kind(node, NodeKind::SharedResource.as_str()));
        }
        if let Some(node) = self.nodes.get_mut(&resource) {
            node.owners.insert(owner.to_string());
        }
        Ok(())
    }

    /// Releases an owner of a shared resource.
    ///
    /// Returns true when the last owner was released and the node removed.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` for anything but shared resources, or a
    /// structural error if the last release cannot remove the node.
    pub fn release(&mut self, resource: NodeId, owner: &str) -> Result<bool> {
        let node = self.node(resource)?;
        if node.kind() != NodeKind::SharedResource {
            return Err(wrong_kind(node, NodeKind::SharedResource.as_str()));
        }
        if let Some(node) = self.nodes.get_mut(&resource) {
            node.owners.remove(owner);
            if !node.owners.is_empty() {
                return Ok(false);
            }
        }
        self.remove(resource)?;
        Ok(true)
    }

    /// Removes a node and every edge pointing at it.
    ///
    /// # Errors
    ///
    /// Returns `RemovalConflict` while children or bound overlays are still
    /// in the graph, or while a shared resource still has owners.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let mut dependents: Vec<String> = node
            .dependents()
            .filter(|context| self.contains(context))
            .map(str::to_string)
            .collect();
        dependents.extend(node.owners().iter().cloned());
        if !dependents.is_empty() {
            return Err(StructuralError::RemovalConflict {
                context: node.context().to_string(),
                dependents,
            }
            .into());
        }
        let context = node.context().to_string();
        self.purge(&context);
        Ok(())
    }

    /// Replaces the recorded slot bindings of an overlay.
    pub(crate) fn set_bindings(&mut self, id: NodeId, bindings: Vec<SlotBinding>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.bindings = bindings;
        }
    }

    /// Removes a node without checks, stripping inbound edges.
    pub(crate) fn purge(&mut self, context: &str) -> Option<Node> {
        let id = self.index.remove(context)?;
        let node = self.nodes.remove(&id)?;
        for other in self.nodes.values_mut() {
            other.dependencies.retain(|d| d.to() != context);
        }
        debug!("Removed node {context}");
        Some(node)
    }

    /// Inserts or replaces a node keeping its id.
    pub(crate) fn insert_node(&mut self, node: Node) {
        if let Some(previous) = self.index.get(node.context()).copied() {
            self.nodes.remove(&previous);
        }
        self.next_id = self.next_id.max(node.id().sequence() + 1);
        self.index.insert(node.context().to_string(), node.id());
        self.nodes.insert(node.id(), node);
    }

    /// Removes the edge `from -> to` if present.
    pub(crate) fn remove_dependency(&mut self, from: &str, to: &str) {
        if let Some(node) = self.node_mut(from) {
            node.dependencies.retain(|d| d.to() != to);
        }
    }

    pub(crate) fn node_mut(&mut self, context: &str) -> Option<&mut Node> {
        let id = self.index.get(context)?;
        self.nodes.get_mut(id)
    }

    pub(crate) fn set_dirty(&mut self, context: &str, dirty: bool) {
        if let Some(node) = self.node_mut(context) {
            node.dirty = dirty;
        }
    }

    /// Returns the edge `from -> to`, creating it when absent.
    ///
    /// The relationship is only set on edges that have none yet.
    pub(crate) fn ensure_dependency(
        &mut self,
        from: &str,
        to: &str,
        relationship: Option<Relationship>,
    ) -> Option<&mut Dependency> {
        let node = self.node_mut(from)?;
        let position = match node.dependencies.iter().position(|d| d.to() == to) {
            Some(position) => position,
            None => {
                node.dependencies.push(Dependency::new(from, to));
                node.dependencies.len() - 1
            }
        };
        let dependency = &mut node.dependencies[position];
        if let Some(relationship) = relationship {
            if dependency.relationship().is_none() {
                dependency.set_relationship(relationship);
            }
        }
        Some(dependency)
    }

    /// Allocates the next id.
    pub(crate) fn allocate(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn prepare(&mut self, spec: NodeSpec, parent: Option<&str>) -> Result<Node> {
        let class = Arc::clone(self.classes.class(&spec.class_name)?);
        let context = derive_context(
            class.kind(),
            class.package(),
            class.node_type(),
            &spec.identity,
            parent,
        );
        if let Some(problem) = identity_problem(&spec.identity) {
            return Err(ValidationError::new(context, class.identity_field(), problem).into());
        }
        if self.contains(&context) {
            return Err(StructuralError::DuplicateNode { context }.into());
        }

        let mut properties = spec.properties;
        if let Some(declared) = properties.get(class.identity_field()) {
            if declared.as_str() != Some(spec.identity.as_str()) {
                return Err(ValidationError::new(
                    context,
                    class.identity_field(),
                    "does not match the node identity",
                )
                .into());
            }
        }
        properties.insert(
            class.identity_field().to_string(),
            Value::from(spec.identity.clone()),
        );
        validate_properties(&context, class.constraints(), &properties)?;

        let mut node = Node::blank(self.allocate(), class.as_ref(), &spec.identity, context);
        node.properties = properties;
        Ok(node)
    }

    fn attach(&mut self, node: Node) -> NodeId {
        let id = node.id();
        debug!("Added {} node {}", node.kind(), node.context());
        self.index.insert(node.context().to_string(), id);
        self.nodes.insert(id, node);
        id
    }

    fn connect_child(&mut self, parent: NodeId, child: NodeId) {
        let (Some(parent_node), Some(child_node)) = (self.nodes.get(&parent), self.nodes.get(&child))
        else {
            return;
        };
        let parent_context = parent_node.context().to_string();
        let parent_field = parent_node.identity_field().to_string();
        let child_context = child_node.context().to_string();
        let child_field = child_node.identity_field().to_string();

        if let Some(edge) =
            self.ensure_dependency(&parent_context, &child_context, Some(Relationship::Child))
        {
            edge.add_behavior(Behavior::new(
                parent_field.clone(),
                DiffAction::Add,
                child_field.clone(),
                DiffAction::Add,
            ));
        }
        if let Some(edge) =
            self.ensure_dependency(&child_context, &parent_context, Some(Relationship::Parent))
        {
            edge.add_behavior(Behavior::new(
                child_field,
                DiffAction::Delete,
                parent_field,
                DiffAction::Delete,
            ));
        }
    }
}

fn missing_id(id: NodeId) -> KeystoneError {
    StructuralError::NodeNotFound {
        context: format!("#{}", id.sequence()),
    }
    .into()
}

fn self_edge(context: &str) -> KeystoneError {
    BehaviorError::Malformed {
        from: context.to_string(),
        to: context.to_string(),
        reason: String::from("a node cannot depend on itself"),
    }
    .into()
}

fn wrong_kind(node: &Node, expected: &str) -> KeystoneError {
    StructuralError::WrongKind {
        context: node.context().to_string(),
        kind: node.kind().to_string(),
        expected: expected.to_string(),
    }
    .into()
}
