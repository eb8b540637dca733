//! Persisted graph documents.
//!
//! A document maps every context to its class discriminator and payload.
//! `BTreeMap` keys and `serde_json` object maps keep the encoding canonical,
//! so equal graphs always produce byte-identical documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SerializationError};
use crate::graph::{Anchor, Dependency, NodeKind};
use crate::overlay::{AnchorSlot, SlotBinding};

/// State document holding the model graph.
pub const MODELS_DOCUMENT: &str = "models.json";

/// State document holding the resource graph.
pub const RESOURCES_DOCUMENT: &str = "resources.json";

/// State document holding the transaction journal.
pub const JOURNAL_DOCUMENT: &str = "journal.json";

/// State document holding the last failed transaction.
pub const CHECKPOINT_DOCUMENT: &str = "checkpoint.json";

/// Serialized graph keyed by context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    entries: BTreeMap<String, DocumentEntry>,
}

/// One persisted node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEntry {
    /// Class discriminator.
    pub class_name: String,
    /// Node data.
    pub payload: NodePayload,
}

/// Persisted node data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePayload {
    /// Creation order.
    pub order: u64,
    /// Node family.
    pub kind: NodeKind,
    /// Type name.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Package namespace.
    pub package: String,
    /// Identity property name.
    pub identity_field: String,
    /// Identity value.
    pub identity: String,
    /// Declared properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Observed state.
    #[serde(default)]
    pub response: Map<String, Value>,
    /// Outgoing edges.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Owned anchors.
    #[serde(default)]
    pub anchors: Vec<Anchor>,
    /// Overlay slot definitions.
    #[serde(default)]
    pub slots: Vec<AnchorSlot>,
    /// Overlay slot resolutions.
    #[serde(default)]
    pub bindings: Vec<SlotBinding>,
    /// Shared resource owners.
    #[serde(default)]
    pub owners: BTreeSet<String>,
    /// Set while the resource's real-world state is unconfirmed.
    #[serde(default)]
    pub dirty: bool,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, context: String, entry: DocumentEntry) {
        self.entries.insert(context, entry);
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, context: &str) -> Option<&DocumentEntry> {
        self.entries.get(context)
    }

    /// Entries sorted by context.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &DocumentEntry)> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the document has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Contexts flagged dirty.
    #[must_use]
    pub fn dirty_contexts(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.payload.dirty)
            .map(|(context, _)| context.clone())
            .collect()
    }

    /// Clears every dirty flag, returning the affected contexts.
    pub fn clear_dirty(&mut self) -> Vec<String> {
        let mut cleared = Vec::new();
        for (context, entry) in &mut self.entries {
            if entry.payload.dirty {
                entry.payload.dirty = false;
                cleared.push(context.clone());
            }
        }
        cleared
    }

    /// Encodes the document.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| SerializationError::json("graph", e).into())
    }

    /// Decodes a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid document.
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::json(name, e).into())
    }

    /// SHA-256 of the canonical encoding, hex encoded.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint_bytes(&self.to_bytes()?))
    }
}

/// SHA-256 of raw bytes, hex encoded.
#[must_use]
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
