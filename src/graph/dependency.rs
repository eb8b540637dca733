//! Typed dependency edges and the behaviors that order diffs across them.
//!
//! A behavior `(on_field, on_action) -> (to_field, to_action)` on the edge
//! `from -> to` means the change on `to` is ordered after the change on
//! `from`. Fields are not checked against the node schema; behaviors may
//! carry synthetic coordination signals.

use serde::{Deserialize, Serialize};

use crate::error::BehaviorError;
use crate::planner::DiffAction;

/// Role of an edge in the node tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// `to` is the parent of `from`.
    Parent,
    /// `to` is a child of `from`.
    Child,
    /// `to` is an overlay bound to an anchor of `from`.
    Binding,
    /// `from` is an overlay bound to an anchor of `to`.
    Bound,
}

/// A field-transition rule attached to a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Behavior {
    /// Field changed on the `from` node.
    pub on_field: String,
    /// Kind of change on the `from` node.
    pub on_action: DiffAction,
    /// Field changed on the `to` node.
    pub to_field: String,
    /// Kind of change on the `to` node.
    pub to_action: DiffAction,
}

/// A directed edge plus its behaviors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    from: String,
    to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relationship: Option<Relationship>,
    #[serde(default)]
    behaviors: Vec<Behavior>,
}

impl Behavior {
    /// Creates a new behavior.
    #[must_use]
    pub fn new(
        on_field: impl Into<String>,
        on_action: DiffAction,
        to_field: impl Into<String>,
        to_action: DiffAction,
    ) -> Self {
        Self {
            on_field: on_field.into(),
            on_action,
            to_field: to_field.into(),
            to_action,
        }
    }

    /// Checks the rule is well formed for the given edge.
    ///
    /// # Errors
    ///
    /// Returns an error if a field name is blank.
    pub fn check(&self, from: &str, to: &str) -> Result<(), BehaviorError> {
        if self.on_field.trim().is_empty() || self.to_field.trim().is_empty() {
            return Err(BehaviorError::Malformed {
                from: from.to_string(),
                to: to.to_string(),
                reason: String::from("behavior fields cannot be empty"),
            });
        }
        Ok(())
    }

    /// Exact 4-tuple comparison.
    #[must_use]
    pub fn matches(
        &self,
        on_field: &str,
        on_action: DiffAction,
        to_field: &str,
        to_action: DiffAction,
    ) -> bool {
        self.on_field == on_field
            && self.on_action == on_action
            && self.to_field == to_field
            && self.to_action == to_action
    }
}

impl Dependency {
    /// Creates an edge without behaviors.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relationship: None,
            behaviors: Vec::new(),
        }
    }

    /// Sets the tree relationship of this edge.
    #[must_use]
    pub const fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationship = Some(relationship);
        self
    }

    /// Source node context.
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Target node context.
    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Tree relationship, if any.
    #[must_use]
    pub const fn relationship(&self) -> Option<Relationship> {
        self.relationship
    }

    /// Registered behaviors.
    #[must_use]
    pub fn behaviors(&self) -> &[Behavior] {
        &self.behaviors
    }

    /// Adds a behavior. Returns false if an identical one exists.
    pub fn add_behavior(&mut self, behavior: Behavior) -> bool {
        if self.behaviors.contains(&behavior) {
            return false;
        }
        self.behaviors.push(behavior);
        true
    }

    /// Returns true if a behavior matches the 4-tuple exactly.
    #[must_use]
    pub fn has_matching_behavior(
        &self,
        on_field: &str,
        on_action: DiffAction,
        to_field: &str,
        to_action: DiffAction,
    ) -> bool {
        self.behaviors
            .iter()
            .any(|b| b.matches(on_field, on_action, to_field, to_action))
    }

    pub(crate) fn set_relationship(&mut self, relationship: Relationship) {
        self.relationship = Some(relationship);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behaviors_are_additive() {
        let mut dep = Dependency::new("app=t", "region=r1,app=t");
        let rule = Behavior::new("name", DiffAction::Add, "regionId", DiffAction::Add);

        assert!(dep.add_behavior(rule.clone()));
        assert!(!dep.add_behavior(rule));
        assert_eq!(dep.behaviors().len(), 1);
    }

    #[test]
    fn test_matching_is_exact() {
        let mut dep = Dependency::new("app=t", "region=r1,app=t");
        dep.add_behavior(Behavior::new(
            "name",
            DiffAction::Add,
            "regionId",
            DiffAction::Add,
        ));

        assert!(dep.has_matching_behavior("name", DiffAction::Add, "regionId", DiffAction::Add));
        assert!(!dep.has_matching_behavior("name", DiffAction::Update, "regionId", DiffAction::Add));
        assert!(!dep.has_matching_behavior("name", DiffAction::Add, "regionId", DiffAction::Delete));
    }

    #[test]
    fn test_synthetic_fields_are_allowed() {
        let rule = Behavior::new("sibling", DiffAction::Add, "sibling", DiffAction::Add);
        assert!(rule.check("a=1", "b=2").is_ok());

        let blank = Behavior::new(" ", DiffAction::Add, "sibling", DiffAction::Add);
        assert!(blank.check("a=1", "b=2").is_err());
    }
}
