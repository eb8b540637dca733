//! Overlay slots and their recorded resolutions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::AnchorRef;

/// How many anchors a schema slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one anchor.
    Single,
    /// One or more anchors.
    Many,
}

/// Filter over synthesized anchor properties.
///
/// Every listed property must be present on the anchor with an equal value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorQuery {
    /// Required anchor id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_id: Option<String>,
    /// Required type of the node owning the anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    /// Required property values.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// What a slot binds to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnchorBinding {
    /// A fixed anchor.
    Literal(AnchorRef),
    /// Every anchor matching a query.
    Schema {
        /// Anchor filter.
        query: AnchorQuery,
        /// Accepted number of matches.
        cardinality: Cardinality,
    },
}

/// A named slot of an overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorSlot {
    name: String,
    binding: AnchorBinding,
}

/// The anchors a slot resolved to during the last binding pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    /// Slot name.
    pub slot: String,
    /// Resolved anchors in index order.
    pub targets: Vec<AnchorRef>,
}

impl AnchorQuery {
    /// Query matching an anchor id.
    #[must_use]
    pub fn by_id(anchor_id: impl Into<String>) -> Self {
        Self {
            anchor_id: Some(anchor_id.into()),
            ..Self::default()
        }
    }

    /// Restricts the query to anchors owned by nodes of `node_type`.
    #[must_use]
    pub fn on_type(mut self, node_type: impl Into<String>) -> Self {
        self.parent_type = Some(node_type.into());
        self
    }

    /// Requires a property value.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(field.into(), value.into());
        self
    }

    /// Checks the query against synthesized anchor properties.
    #[must_use]
    pub fn matches(&self, synthesized: &Map<String, Value>, parent_type: &str) -> bool {
        if self
            .anchor_id
            .as_deref()
            .is_some_and(|id| synthesized.get("anchorId").and_then(Value::as_str) != Some(id))
        {
            return false;
        }
        if self.parent_type.as_deref().is_some_and(|t| t != parent_type) {
            return false;
        }
        self.properties
            .iter()
            .all(|(field, value)| synthesized.get(field) == Some(value))
    }
}

impl AnchorSlot {
    /// Slot bound to a fixed anchor.
    #[must_use]
    pub fn literal(name: impl Into<String>, anchor: AnchorRef) -> Self {
        Self {
            name: name.into(),
            binding: AnchorBinding::Literal(anchor),
        }
    }

    /// Slot bound through a query.
    #[must_use]
    pub fn schema(name: impl Into<String>, query: AnchorQuery, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            binding: AnchorBinding::Schema { query, cardinality },
        }
    }

    /// Slot name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binding definition.
    #[must_use]
    pub const fn binding(&self) -> &AnchorBinding {
        &self.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_matching() {
        let mut synthesized = Map::new();
        synthesized.insert(String::from("anchorId"), json!("ingress"));
        synthesized.insert(String::from("parent"), json!("server=web,app=t"));
        synthesized.insert(String::from("port"), json!(443));

        assert!(AnchorQuery::by_id("ingress").matches(&synthesized, "server"));
        assert!(AnchorQuery::by_id("ingress").with("port", 443).matches(&synthesized, "server"));
        assert!(!AnchorQuery::by_id("ingress").with("port", 80).matches(&synthesized, "server"));
        assert!(!AnchorQuery::by_id("ingress").on_type("database").matches(&synthesized, "server"));
        assert!(AnchorQuery::default().with("parent", "server=web,app=t").matches(&synthesized, "server"));
    }

    #[test]
    fn test_slot_serialization() {
        let slot = AnchorSlot::schema("target", AnchorQuery::by_id("ingress"), Cardinality::Many);
        let value = serde_json::to_value(&slot).unwrap();
        assert_eq!(value["binding"]["type"], json!("schema"));
        assert_eq!(value["binding"]["cardinality"], json!("many"));
        let back: AnchorSlot = serde_json::from_value(value).unwrap();
        assert_eq!(back, slot);
    }
}
