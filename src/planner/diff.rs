//! Diff engine for comparing a persisted snapshot with the current graph.
//!
//! Nodes are matched by context. New nodes yield an ADD on their identity
//! field, vanished nodes a DELETE, and nodes present in both are compared
//! by their class hooks.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{Result, StructuralError};
use crate::graph::{Graph, Node, NodeKind, Relationship};

use super::types::{Diff, DiffAction};

/// Synthetic field carrying the owner set of shared resources.
pub const OWNERS_FIELD: &str = "owners";

/// Engine for computing diffs between two graphs of the same family.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes every diff turning `previous` into `current`.
    ///
    /// Diffs of current nodes are emitted in creation order, followed by the
    /// deletes in previous creation order.
    ///
    /// # Errors
    ///
    /// Returns `RemovalConflict` if a deleted node still has children in
    /// `current`, or an error if a node class is not registered.
    pub fn compute(&self, previous: &Graph, current: &Graph) -> Result<Vec<Diff>> {
        let mut diffs = Vec::new();

        for node in current.nodes() {
            let class = current.classes().class(node.class_name())?;
            match previous.find(node.context()) {
                None => {
                    debug!("Node {} needs to be added", node.context());
                    let add = Diff::new(
                        node,
                        DiffAction::Add,
                        node.identity_field(),
                        Value::from(node.identity()),
                    );
                    diffs.extend(class.unpack(add, node));
                }
                Some(before) => {
                    diffs.extend(class.diff_properties(before, node));
                    if node.kind() == NodeKind::SharedResource && before.owners() != node.owners() {
                        diffs.push(Diff::new(
                            node,
                            DiffAction::Update,
                            OWNERS_FIELD,
                            Value::from(node.owners().iter().cloned().collect::<Vec<_>>()),
                        ));
                    }
                    diffs.extend(class.diff_anchors(before, node));
                }
            }
        }

        for node in previous.nodes() {
            if current.contains(node.context()) {
                continue;
            }
            let live: Vec<String> = live_children(node, current).into_iter().collect();
            if !live.is_empty() {
                return Err(StructuralError::RemovalConflict {
                    context: node.context().to_string(),
                    dependents: live,
                }
                .into());
            }
            debug!("Node {} needs to be deleted", node.context());
            diffs.push(Diff::new(
                node,
                DiffAction::Delete,
                node.identity_field(),
                Value::from(node.identity()),
            ));
        }

        Ok(diffs)
    }
}

fn live_children(node: &Node, current: &Graph) -> BTreeSet<String> {
    node.dependencies()
        .iter()
        .filter(|d| d.relationship() == Some(Relationship::Child))
        .filter(|d| current.contains(d.to()))
        .map(|d| d.to().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeSpec, StaticClass};
    use crate::serialization::ClassRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn classes() -> Arc<ClassRegistry> {
        let mut registry = ClassRegistry::new();
        registry
            .register(StaticClass::model("@example", "app", "name"))
            .unwrap();
        registry
            .register(StaticClass::model("@example", "region", "regionId"))
            .unwrap();
        registry
            .register(StaticClass::shared("@example", "bucket", "bucketName"))
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_new_nodes_are_added() {
        let classes = classes();
        let previous = Graph::new(Arc::clone(&classes));
        let mut current = Graph::new(classes);
        let app = current.add_node(NodeSpec::new("@example/app", "t")).unwrap();
        current
            .add_child(app, NodeSpec::new("@example/region", "r1"))
            .unwrap();

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].action(), DiffAction::Add);
        assert_eq!(diffs[0].field(), "name");
        assert_eq!(diffs[0].value(), &json!("t"));
        assert_eq!(diffs[1].context(), "region=r1,app=t");
    }

    #[test]
    fn test_identical_graphs_have_no_diffs() {
        let mut graph = Graph::new(classes());
        let app = graph
            .add_node(NodeSpec::new("@example/app", "t").property("tier", "small"))
            .unwrap();
        graph
            .add_child(app, NodeSpec::new("@example/region", "r1"))
            .unwrap();

        let diffs = DiffEngine::new().compute(&graph, &graph.clone()).unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_property_change_is_updated() {
        let mut previous = Graph::new(classes());
        let app = previous
            .add_node(NodeSpec::new("@example/app", "t").property("tier", "small"))
            .unwrap();
        let mut current = previous.clone();
        current.set_property(app, "tier", json!("large")).unwrap();

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].action(), DiffAction::Update);
        assert_eq!(diffs[0].field(), "tier");
        assert_eq!(diffs[0].value(), &json!("large"));
    }

    #[test]
    fn test_delete_with_live_children_conflicts() {
        let classes = classes();
        let mut previous = Graph::new(Arc::clone(&classes));
        let app = previous.add_node(NodeSpec::new("@example/app", "t")).unwrap();
        previous
            .add_child(app, NodeSpec::new("@example/region", "r1"))
            .unwrap();

        // A rebuilt graph that keeps the region but drops its parent.
        let mut current = Graph::new(classes);
        let orphan = previous.find("region=r1,app=t").cloned().unwrap();
        current.insert_node(orphan);

        let err = DiffEngine::new().compute(&previous, &current).unwrap_err();
        assert_eq!(err.context(), Some("app=t"));
    }

    #[test]
    fn test_owner_changes_are_reported() {
        let mut previous = Graph::new(classes());
        let bucket = previous
            .add_node(NodeSpec::new("@example/bucket", "logs"))
            .unwrap();
        previous.share(bucket, "app=a").unwrap();
        previous.share(bucket, "app=b").unwrap();

        let mut current = previous.clone();
        current.release(bucket, "app=a").unwrap();

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field(), OWNERS_FIELD);
        assert_eq!(diffs[0].value(), &json!(["app=b"]));
    }
}
