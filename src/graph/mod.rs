//! The node graph.
//!
//! This module holds the provider-agnostic node model: identities and
//! contexts, typed dependency edges with behaviors, anchors, node classes
//! and the validated arena every mutation goes through.

mod anchor;
mod arena;
mod class;
mod context;
mod dependency;
mod node;
mod validation;

pub use anchor::{Anchor, AnchorRef};
pub use arena::{Graph, NodeSpec};
pub use class::{property_diffs, InverseStrategy, NodeClass, StaticClass};
pub use context::{derive_context, identity_problem, segments};
pub use dependency::{Behavior, Dependency, Relationship};
pub use node::{Node, NodeId, NodeKind};
pub use validation::{validate_change, validate_properties, FieldConstraint, Rule};
