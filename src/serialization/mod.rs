//! Serialization boundary between graphs and the state store.
//!
//! Classes are registered explicitly and in order; documents are keyed by
//! context and rebuilt with a two-pass arena load.

mod document;
mod registry;
mod serializer;

pub use document::{
    fingerprint_bytes, Document, DocumentEntry, NodePayload, CHECKPOINT_DOCUMENT,
    JOURNAL_DOCUMENT, MODELS_DOCUMENT, RESOURCES_DOCUMENT,
};
pub use registry::ClassRegistry;
pub use serializer::GraphSerializer;
