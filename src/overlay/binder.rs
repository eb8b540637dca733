//! Overlay binding pass.
//!
//! Resolves every overlay slot against a fresh anchor index, records the
//! resolution on the overlay and keeps the binding edges in sync. All slots
//! are resolved before the graph is touched, so a failing pass leaves the
//! graph unchanged.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{Result, StructuralError};
use crate::graph::{AnchorRef, Behavior, Graph, Node, NodeId, NodeKind, Relationship};
use crate::planner::{Diff, DiffAction, ANCHORS_FIELD_PREFIX};

use super::index::AnchorIndex;
use super::slot::{AnchorBinding, Cardinality, SlotBinding};

/// Binds overlay slots to anchors.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayBinder;

impl OverlayBinder {
    /// Resolves every overlay of the graph.
    ///
    /// Returns the number of overlays bound.
    ///
    /// # Errors
    ///
    /// Returns `AnchorNotFound` if a slot resolves to nothing and
    /// `AnchorAmbiguous` if a single slot matches several anchors.
    pub fn bind(graph: &mut Graph) -> Result<usize> {
        let index = AnchorIndex::build(graph);
        let resolved: Vec<(NodeId, Vec<SlotBinding>)> = graph
            .nodes()
            .filter(|node| node.kind() == NodeKind::Overlay)
            .map(|overlay| resolve(overlay, &index).map(|bindings| (overlay.id(), bindings)))
            .collect::<Result<_>>()?;

        let count = resolved.len();
        for (id, bindings) in resolved {
            sync_edges(graph, id, &bindings);
            graph.set_bindings(id, bindings);
        }
        debug!("Bound {count} overlays against {} anchors", index.len());
        Ok(count)
    }
}

fn resolve(overlay: &Node, index: &AnchorIndex) -> Result<Vec<SlotBinding>> {
    let mut literal_targets: BTreeSet<&AnchorRef> = BTreeSet::new();
    let mut bindings: Vec<Option<SlotBinding>> = vec![None; overlay.slots().len()];

    // Literal slots first: schema slots never take an anchor bound literally.
    for (position, slot) in overlay.slots().iter().enumerate() {
        if let AnchorBinding::Literal(reference) = slot.binding() {
            let entry = index
                .get(reference)
                .ok_or_else(|| not_found(overlay, slot.name()))?;
            literal_targets.insert(&entry.reference);
            bindings[position] = Some(SlotBinding {
                slot: slot.name().to_string(),
                targets: vec![reference.clone()],
            });
        }
    }

    for (position, slot) in overlay.slots().iter().enumerate() {
        let AnchorBinding::Schema { query, cardinality } = slot.binding() else {
            continue;
        };
        let matches: Vec<&AnchorRef> = index
            .query(query)
            .into_iter()
            .filter(|reference| !literal_targets.contains(reference))
            .collect();
        if matches.is_empty() {
            return Err(not_found(overlay, slot.name()));
        }
        if *cardinality == Cardinality::Single && matches.len() > 1 {
            return Err(StructuralError::AnchorAmbiguous {
                overlay: overlay.context().to_string(),
                slot: slot.name().to_string(),
                matches: matches.iter().map(ToString::to_string).collect(),
            }
            .into());
        }
        bindings[position] = Some(SlotBinding {
            slot: slot.name().to_string(),
            targets: matches.into_iter().cloned().collect(),
        });
    }

    Ok(bindings.into_iter().flatten().collect())
}

fn not_found(overlay: &Node, slot: &str) -> crate::error::KeystoneError {
    StructuralError::AnchorNotFound {
        overlay: overlay.context().to_string(),
        slot: slot.to_string(),
    }
    .into()
}

fn sync_edges(graph: &mut Graph, id: NodeId, bindings: &[SlotBinding]) {
    let Some(overlay) = graph.get(id) else {
        return;
    };
    let overlay_context = overlay.context().to_string();
    let overlay_field = overlay.identity_field().to_string();
    let parents: BTreeSet<String> = bindings
        .iter()
        .flat_map(|binding| binding.targets.iter())
        .map(|target| target.parent.clone())
        .filter(|parent| *parent != overlay_context)
        .collect();

    // Drop binding edges to anchors that are no longer targeted.
    let stale: Vec<String> = graph
        .nodes()
        .filter(|node| !parents.contains(node.context()))
        .filter(|node| {
            node.dependency_to(&overlay_context)
                .is_some_and(|d| d.relationship() == Some(Relationship::Binding))
        })
        .map(|node| node.context().to_string())
        .collect();
    for parent in &stale {
        graph.remove_dependency(parent, &overlay_context);
        graph.remove_dependency(&overlay_context, parent);
    }

    for parent in parents {
        let Some(parent_field) = graph.find(&parent).map(|n| n.identity_field().to_string())
        else {
            continue;
        };
        if let Some(edge) =
            graph.ensure_dependency(&parent, &overlay_context, Some(Relationship::Binding))
        {
            edge.add_behavior(Behavior::new(
                parent_field.clone(),
                DiffAction::Add,
                overlay_field.clone(),
                DiffAction::Add,
            ));
        }
        if let Some(edge) =
            graph.ensure_dependency(&overlay_context, &parent, Some(Relationship::Bound))
        {
            edge.add_behavior(Behavior::new(
                overlay_field.clone(),
                DiffAction::Delete,
                parent_field,
                DiffAction::Delete,
            ));
        }
    }
}

/// Emits `UPDATE anchors.<slot>` for every slot whose targets changed.
#[must_use]
pub fn anchor_binding_diffs(previous: &Node, current: &Node) -> Vec<Diff> {
    let mut diffs: Vec<Diff> = current
        .bindings()
        .iter()
        .filter(|binding| {
            previous
                .bindings()
                .iter()
                .find(|b| b.slot == binding.slot)
                .is_none_or(|b| b.targets != binding.targets)
        })
        .map(|binding| {
            let targets: Vec<Value> = binding
                .targets
                .iter()
                .map(|target| Value::from(target.to_string()))
                .collect();
            Diff::new(
                current,
                DiffAction::Update,
                format!("{ANCHORS_FIELD_PREFIX}{}", binding.slot),
                Value::Array(targets),
            )
        })
        .collect();

    diffs.extend(
        previous
            .bindings()
            .iter()
            .filter(|b| !current.bindings().iter().any(|c| c.slot == b.slot))
            .map(|b| {
                Diff::new(
                    current,
                    DiffAction::Update,
                    format!("{ANCHORS_FIELD_PREFIX}{}", b.slot),
                    Value::Null,
                )
            }),
    );
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Anchor, NodeSpec, StaticClass};
    use crate::overlay::{AnchorQuery, AnchorSlot};
    use crate::serialization::ClassRegistry;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn graph() -> Graph {
        let mut registry = ClassRegistry::new();
        registry
            .register(StaticClass::model("@example", "server", "serverName"))
            .unwrap();
        registry
            .register(StaticClass::overlay("@example", "firewall", "firewallName"))
            .unwrap();
        let mut graph = Graph::new(Arc::new(registry));
        for name in ["web", "api"] {
            let server = graph
                .add_node(NodeSpec::new("@example/server", name))
                .unwrap();
            let mut props = Map::new();
            props.insert(String::from("port"), json!(443));
            graph.add_anchor(server, Anchor::new("ingress", props)).unwrap();
        }
        graph
    }

    #[test]
    fn test_literal_binding_adds_edges() {
        let mut graph = graph();
        let slot = AnchorSlot::literal("target", AnchorRef::new("ingress", "server=web"));
        let fw = graph
            .add_overlay(NodeSpec::new("@example/firewall", "fw"), vec![slot])
            .unwrap();

        assert_eq!(OverlayBinder::bind(&mut graph).unwrap(), 1);
        let overlay = graph.get(fw).unwrap();
        assert_eq!(overlay.bindings()[0].targets, vec![AnchorRef::new("ingress", "server=web")]);
        assert!(graph.has_matching_behavior(
            "server=web",
            "firewall=fw",
            ("serverName", DiffAction::Add),
            ("firewallName", DiffAction::Add),
        ));
        assert!(graph.has_matching_behavior(
            "firewall=fw",
            "server=web",
            ("firewallName", DiffAction::Delete),
            ("serverName", DiffAction::Delete),
        ));
    }

    #[test]
    fn test_single_schema_slot_is_ambiguous() {
        let mut graph = graph();
        let slot = AnchorSlot::schema("target", AnchorQuery::by_id("ingress"), Cardinality::Single);
        graph
            .add_overlay(NodeSpec::new("@example/firewall", "fw"), vec![slot])
            .unwrap();

        let err = OverlayBinder::bind(&mut graph).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_literal_takes_precedence_over_schema() {
        let mut graph = graph();
        let slots = vec![
            AnchorSlot::schema("other", AnchorQuery::by_id("ingress"), Cardinality::Single),
            AnchorSlot::literal("primary", AnchorRef::new("ingress", "server=web")),
        ];
        let fw = graph
            .add_overlay(NodeSpec::new("@example/firewall", "fw"), slots)
            .unwrap();

        OverlayBinder::bind(&mut graph).unwrap();
        let bindings = graph.get(fw).unwrap().bindings();
        assert_eq!(bindings[0].slot, "other");
        assert_eq!(bindings[0].targets, vec![AnchorRef::new("ingress", "server=api")]);
        assert_eq!(bindings[1].slot, "primary");
    }

    #[test]
    fn test_missing_anchor() {
        let mut graph = graph();
        let slot = AnchorSlot::schema("db", AnchorQuery::by_id("postgres"), Cardinality::Many);
        graph
            .add_overlay(NodeSpec::new("@example/firewall", "fw"), vec![slot])
            .unwrap();

        let err = OverlayBinder::bind(&mut graph).unwrap_err();
        assert!(err.to_string().contains("matched no anchor"));
    }

    #[test]
    fn test_rebinding_reports_changed_targets() {
        let mut graph = graph();
        let slot = AnchorSlot::schema(
            "target",
            AnchorQuery::by_id("ingress").with("port", 443),
            Cardinality::Many,
        );
        let fw = graph
            .add_overlay(NodeSpec::new("@example/firewall", "fw"), vec![slot])
            .unwrap();
        OverlayBinder::bind(&mut graph).unwrap();
        let before = graph.get(fw).unwrap().clone();
        assert_eq!(before.bindings()[0].targets.len(), 2);

        graph.purge("server=api");
        OverlayBinder::bind(&mut graph).unwrap();
        let after = graph.get(fw).unwrap();

        let diffs = anchor_binding_diffs(&before, after);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field(), "anchors.target");
        assert_eq!(diffs[0].value(), &json!(["ingress@server=web"]));
        assert!(graph.find("server=web").unwrap().dependency_to("firewall=fw").is_some());
    }
}
