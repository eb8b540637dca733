//! Anchor index rebuilt from the model graph at every binding pass.

use serde_json::{Map, Value};

use crate::graph::{AnchorRef, Graph};

use super::slot::AnchorQuery;

/// One anchor as seen by queries.
#[derive(Debug, Clone)]
pub struct IndexedAnchor {
    /// Anchor identity.
    pub reference: AnchorRef,
    /// Type of the owning node.
    pub parent_type: String,
    /// Anchor properties plus `anchorId` and `parent`.
    pub synthesized: Map<String, Value>,
}

/// All anchors of a graph in node creation order.
#[derive(Debug, Clone, Default)]
pub struct AnchorIndex {
    entries: Vec<IndexedAnchor>,
}

impl AnchorIndex {
    /// Indexes every anchor of the graph.
    #[must_use]
    pub fn build(graph: &Graph) -> Self {
        let entries = graph
            .nodes()
            .flat_map(|node| {
                node.anchors().iter().map(move |anchor| IndexedAnchor {
                    reference: anchor.reference(),
                    parent_type: node.node_type().to_string(),
                    synthesized: anchor.synthesize(),
                })
            })
            .collect();
        Self { entries }
    }

    /// Number of indexed anchors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the graph has no anchors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an anchor by reference.
    #[must_use]
    pub fn get(&self, reference: &AnchorRef) -> Option<&IndexedAnchor> {
        self.entries.iter().find(|entry| &entry.reference == reference)
    }

    /// Returns every anchor matching the query, in index order.
    #[must_use]
    pub fn query(&self, query: &AnchorQuery) -> Vec<&AnchorRef> {
        self.entries
            .iter()
            .filter(|entry| query.matches(&entry.synthesized, &entry.parent_type))
            .map(|entry| &entry.reference)
            .collect()
    }
}
