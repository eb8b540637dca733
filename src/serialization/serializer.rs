//! Conversion between graphs and documents.

use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SerializationError};
use crate::graph::{validate_properties, Graph, Node, NodeId};

use super::document::{Document, DocumentEntry, NodePayload};
use super::registry::ClassRegistry;

/// Converts graphs to documents and back.
#[derive(Debug, Clone)]
pub struct GraphSerializer {
    classes: Arc<ClassRegistry>,
}

impl GraphSerializer {
    /// Creates a serializer using the given class registry.
    #[must_use]
    pub const fn new(classes: Arc<ClassRegistry>) -> Self {
        Self { classes }
    }

    /// Encodes every node of the graph.
    #[must_use]
    pub fn serialize(&self, graph: &Graph) -> Document {
        let mut document = Document::new();
        for node in graph.nodes() {
            document.insert(node.context().to_string(), entry_for(node));
        }
        document
    }

    /// Rebuilds a graph from a document.
    ///
    /// The first pass allocates every node in persisted order; the second
    /// populates fields and resolves edges against the allocated nodes.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown classes, payloads that disagree with
    /// their class, constraint violations and dangling references.
    pub fn deserialize(&self, name: &str, document: &Document) -> Result<Graph> {
        let mut graph = Graph::new(Arc::clone(&self.classes));

        let mut entries: Vec<(&String, &DocumentEntry)> = document.entries().collect();
        entries.sort_by_key(|(_, entry)| entry.payload.order);

        for window in entries.windows(2) {
            if window[0].1.payload.order == window[1].1.payload.order {
                return Err(SerializationError::json(
                    name,
                    format!("{} and {} share order {}", window[0].0, window[1].0, window[1].1.payload.order),
                )
                .into());
            }
        }

        for (context, entry) in &entries {
            let class = self.classes.class(&entry.class_name)?;
            let payload = &entry.payload;
            if class.kind() != payload.kind || class.identity_field() != payload.identity_field {
                return Err(SerializationError::ClassMismatch {
                    context: (*context).clone(),
                    class_name: entry.class_name.clone(),
                    message: format!(
                        "expected {} node identified by '{}'",
                        class.kind(),
                        class.identity_field()
                    ),
                }
                .into());
            }
            let placeholder = Node::blank(
                NodeId(payload.order),
                class.as_ref(),
                &payload.identity,
                (*context).clone(),
            );
            graph.insert_node(placeholder);
        }

        for (context, entry) in &entries {
            let payload = &entry.payload;
            let class = self.classes.class(&entry.class_name)?;
            validate_properties(context, class.constraints(), &payload.properties)?;

            for dependency in &payload.dependencies {
                if dependency.from() != context.as_str() || !graph.contains(dependency.to()) {
                    return Err(SerializationError::DanglingReference {
                        context: (*context).clone(),
                        target: dependency.to().to_string(),
                    }
                    .into());
                }
            }

            if let Some(node) = graph.node_mut(context) {
                node.properties = payload.properties.clone();
                node.response = payload.response.clone();
                node.dependencies = payload.dependencies.clone();
                node.anchors = payload.anchors.clone();
                node.slots = payload.slots.clone();
                node.bindings = payload.bindings.clone();
                node.owners = payload.owners.clone();
                node.dirty = payload.dirty;
            }
        }

        debug!("Deserialized {} nodes from {name}", graph.len());
        Ok(graph)
    }
}

fn entry_for(node: &Node) -> DocumentEntry {
    DocumentEntry {
        class_name: node.class_name().to_string(),
        payload: NodePayload {
            order: node.id().sequence(),
            kind: node.kind(),
            node_type: node.node_type().to_string(),
            package: node.package().to_string(),
            identity_field: node.identity_field().to_string(),
            identity: node.identity().to_string(),
            properties: node.properties().clone(),
            response: node.response().clone(),
            dependencies: node.dependencies().to_vec(),
            anchors: node.anchors().to_vec(),
            slots: node.slots().to_vec(),
            bindings: node.bindings().to_vec(),
            owners: node.owners().clone(),
            dirty: node.is_dirty(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeystoneError;
    use crate::graph::{Anchor, AnchorRef, NodeSpec, StaticClass};
    use crate::overlay::{AnchorSlot, OverlayBinder};
    use crate::planner::DiffEngine;
    use serde_json::{json, Map};

    fn classes() -> Arc<ClassRegistry> {
        let mut registry = ClassRegistry::new();
        registry
            .register(StaticClass::model("@example", "app", "name"))
            .unwrap();
        registry
            .register(StaticClass::model("@example", "region", "regionId"))
            .unwrap();
        registry
            .register(StaticClass::overlay("@example", "firewall", "firewallName"))
            .unwrap();
        Arc::new(registry)
    }

    fn sample(classes: &Arc<ClassRegistry>) -> Graph {
        let mut graph = Graph::new(Arc::clone(classes));
        let app = graph
            .add_node(NodeSpec::new("@example/app", "t").property("tier", "small"))
            .unwrap();
        let region = graph
            .add_child(app, NodeSpec::new("@example/region", "r1"))
            .unwrap();
        let mut props = Map::new();
        props.insert(String::from("port"), json!(443));
        graph.add_anchor(region, Anchor::new("ingress", props)).unwrap();
        graph
            .add_overlay(
                NodeSpec::new("@example/firewall", "fw"),
                vec![AnchorSlot::literal(
                    "target",
                    AnchorRef::new("ingress", "region=r1,app=t"),
                )],
            )
            .unwrap();
        OverlayBinder::bind(&mut graph).unwrap();
        graph
    }

    #[test]
    fn test_round_trip_is_identical() {
        let classes = classes();
        let serializer = GraphSerializer::new(Arc::clone(&classes));
        let graph = sample(&classes);

        let first = serializer.serialize(&graph);
        let restored = serializer.deserialize("models.json", &first).unwrap();
        let second = serializer.serialize(&restored);

        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
        assert!(DiffEngine::new().compute(&restored, &graph).unwrap().is_empty());
        assert_eq!(
            restored.find("region=r1,app=t").unwrap().id(),
            graph.find("region=r1,app=t").unwrap().id()
        );
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let classes = classes();
        let doc = GraphSerializer::new(Arc::clone(&classes)).serialize(&sample(&classes));

        let empty = GraphSerializer::new(Arc::new(ClassRegistry::new()));
        let err = empty.deserialize("models.json", &doc).unwrap_err();
        assert!(matches!(err, KeystoneError::Structural(_)));
    }

    #[test]
    fn test_dangling_reference_is_rejected() {
        let classes = classes();
        let serializer = GraphSerializer::new(Arc::clone(&classes));
        let mut graph = sample(&classes);
        graph.purge("app=t");
        let mut doc = serializer.serialize(&graph);

        // Re-add an edge to the purged parent.
        let region = graph.find("region=r1,app=t").unwrap().clone();
        let mut entry = doc.get("region=r1,app=t").unwrap().clone();
        entry
            .payload
            .dependencies
            .push(crate::graph::Dependency::new(region.context(), "app=t"));
        doc.insert(region.context().to_string(), entry);

        let err = serializer.deserialize("models.json", &doc).unwrap_err();
        assert!(matches!(
            err,
            KeystoneError::Serialization(SerializationError::DanglingReference { .. })
        ));
    }
}
