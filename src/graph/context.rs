//! Context address derivation.
//!
//! Models and overlays are addressed by their ancestry
//! (`environment=qa,region=r1,app=t`); resources by package and type
//! (`@example/vpc=vpc-1`).

use super::node::NodeKind;

/// Characters that would make a context ambiguous.
const RESERVED: &[char] = &[',', '='];

/// Builds the context of a node.
#[must_use]
pub fn derive_context(
    kind: NodeKind,
    package: &str,
    node_type: &str,
    identity: &str,
    parent: Option<&str>,
) -> String {
    if kind.is_resource() {
        return format!("{package}/{node_type}={identity}");
    }
    match parent {
        Some(parent) => format!("{node_type}={identity},{parent}"),
        None => format!("{node_type}={identity}"),
    }
}

/// Returns a reason if the identity cannot be embedded in a context.
#[must_use]
pub fn identity_problem(identity: &str) -> Option<&'static str> {
    if identity.is_empty() {
        Some("identity cannot be empty")
    } else if identity.contains(RESERVED) {
        Some("identity cannot contain ',' or '='")
    } else {
        None
    }
}

/// Splits a model context into `(type, identity)` segments, innermost first.
#[must_use]
pub fn segments(context: &str) -> Vec<(&str, &str)> {
    context
        .split(',')
        .filter_map(|segment| segment.split_once('='))
        .collect()
}
