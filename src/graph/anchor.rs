//! Anchors: typed facts owned by a single node.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A typed fact attached to a node. Identity is `(anchor_id, parent)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    anchor_id: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    parent: String,
}

/// Stable reference to an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRef {
    /// Anchor identifier.
    pub anchor_id: String,
    /// Context of the owning node.
    pub parent: String,
}

impl Anchor {
    /// Creates an anchor that is not attached to a node yet.
    #[must_use]
    pub fn new(anchor_id: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            properties,
            parent: String::new(),
        }
    }

    /// Anchor identifier.
    #[must_use]
    pub fn anchor_id(&self) -> &str {
        &self.anchor_id
    }

    /// Anchor properties.
    #[must_use]
    pub const fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Context of the owning node.
    #[must_use]
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Returns the reference identifying this anchor.
    #[must_use]
    pub fn reference(&self) -> AnchorRef {
        AnchorRef::new(&self.anchor_id, &self.parent)
    }

    /// Properties used by schema queries: own properties plus identity.
    #[must_use]
    pub fn synthesize(&self) -> Map<String, Value> {
        let mut synthesized = self.properties.clone();
        synthesized.insert(String::from("anchorId"), Value::from(self.anchor_id.clone()));
        synthesized.insert(String::from("parent"), Value::from(self.parent.clone()));
        synthesized
    }

    pub(crate) fn attach(&mut self, parent: &str) {
        self.parent = parent.to_string();
    }
}

impl AnchorRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(anchor_id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            parent: parent.into(),
        }
    }
}

impl std::fmt::Display for AnchorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.anchor_id, self.parent)
    }
}
