//! Overlays: composite nodes bound to anchors of other nodes.
//!
//! Slot definitions live on the overlay node. Each diff pass rebuilds the
//! anchor index from the model graph, resolves every slot and records the
//! result on the overlay so the next pass can compare resolutions.

mod binder;
mod index;
mod slot;

pub use binder::{anchor_binding_diffs, OverlayBinder};
pub use index::{AnchorIndex, IndexedAnchor};
pub use slot::{AnchorBinding, AnchorQuery, AnchorSlot, Cardinality, SlotBinding};
