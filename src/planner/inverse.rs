//! Folding committed diffs into the persisted ("actual") snapshot.
//!
//! Only diffs whose actions completed are folded, so the persisted snapshot
//! never claims more than what was applied.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StructuralError};
use crate::graph::{Graph, InverseStrategy, Node};

use super::diff::OWNERS_FIELD;
use super::types::Diff;

/// Prefix of synthetic fields describing overlay slot bindings.
pub const ANCHORS_FIELD_PREFIX: &str = "anchors.";

/// Applies `diff` to `actual` using `strategy`, reading from `desired`.
///
/// # Errors
///
/// Returns `NodeNotFound` if the strategy needs a node that is missing
/// from either graph.
pub fn fold_into(
    actual: &mut Graph,
    desired: &Graph,
    diff: &Diff,
    strategy: InverseStrategy,
) -> Result<()> {
    let context = diff.context();
    match strategy {
        InverseStrategy::Skip => {}
        InverseStrategy::CopyNode => {
            let mut node = desired.dereference(context)?.clone();
            node.dirty = false;
            node.dependencies.retain(|d| actual.contains(d.to()));
            actual.insert_node(node);
            sync_inbound_edges(actual, desired, context);
        }
        InverseStrategy::DropNode => {
            actual.purge(context);
        }
        InverseStrategy::CopyField => {
            let source = desired.dereference(context)?;
            let target = target_mut(actual, context)?;
            copy_field(source, target, diff.field());
            target.response = source.response.clone();
        }
        InverseStrategy::CloneInPlace => {
            let source = desired.dereference(context)?;
            let target = target_mut(actual, context)?;
            target.properties = source.properties.clone();
            target.response = source.response.clone();
            target.owners = source.owners.clone();
            target.anchors = source.anchors.clone();
            target.bindings = source.bindings.clone();
        }
    }
    debug!("Folded {diff} ({strategy:?})");
    Ok(())
}

fn target_mut<'g>(actual: &'g mut Graph, context: &str) -> Result<&'g mut Node> {
    actual.node_mut(context).ok_or_else(|| {
        StructuralError::NodeNotFound {
            context: context.to_string(),
        }
        .into()
    })
}

fn copy_field(source: &Node, target: &mut Node, field: &str) {
    if field == OWNERS_FIELD && source.kind().is_resource() && !source.properties.contains_key(field) {
        target.owners = source.owners.clone();
    } else if field.starts_with(ANCHORS_FIELD_PREFIX) {
        target.bindings = source.bindings.clone();
    } else {
        match source.properties.get(field) {
            Some(value) => {
                target.properties.insert(field.to_string(), value.clone());
            }
            None => {
                target.properties.remove(field);
            }
        }
    }
}

/// Copies edges of `desired` nodes that point at `context` when both ends
/// are present in `actual`.
fn sync_inbound_edges(actual: &mut Graph, desired: &Graph, context: &str) {
    let inbound: Vec<_> = desired
        .nodes()
        .filter_map(|node| node.dependency_to(context).map(|d| (node.context(), d)))
        .filter(|(from, _)| actual.contains(from))
        .map(|(from, d)| (from.to_string(), d.clone()))
        .collect();

    for (from, dependency) in inbound {
        if let Some(edge) = actual.ensure_dependency(&from, context, dependency.relationship()) {
            for behavior in dependency.behaviors() {
                edge.add_behavior(behavior.clone());
            }
        }
    }
}

/// Returns the value recorded for a synthetic or declared field of a node.
#[must_use]
pub fn field_value(node: &Node, field: &str) -> Value {
    if field == OWNERS_FIELD && !node.properties().contains_key(field) {
        return Value::from(node.owners().iter().cloned().collect::<Vec<_>>());
    }
    node.property(field).cloned().unwrap_or(Value::Null)
}
