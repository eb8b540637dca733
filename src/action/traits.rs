//! The action contract implemented by provider packages.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::Graph;
use crate::module::ModuleMetadata;
use crate::planner::Diff;

/// Named values resolved for an action before it runs.
pub type ActionInputs = BTreeMap<String, Value>;

/// Named values produced by an action, visible to later actions.
pub type ActionOutputs = BTreeMap<String, Value>;

/// Graphs and metadata visible to an action while it runs.
///
/// Model actions build the desired resource graph through `resources`.
/// Resource actions record observed state there with
/// [`Graph::set_response`].
#[derive(Debug)]
pub struct ActionScope<'a> {
    /// Current model graph.
    pub models: &'a Graph,
    /// Model graph as last committed.
    pub previous_models: &'a Graph,
    /// Desired resource graph.
    pub resources: &'a mut Graph,
    /// Resource graph as last confirmed.
    pub actual_resources: &'a Graph,
    /// Metadata registered by modules.
    pub metadata: &'a ModuleMetadata,
}

/// A unit of work applying one kind of diff.
#[async_trait]
pub trait Action: Send + Sync {
    /// Unique name within a node kind.
    fn name(&self) -> &str;

    /// Returns true if this action applies the diff.
    fn filter(&self, diff: &Diff) -> bool;

    /// Input names the action needs for this diff.
    fn collect_input(&self, _diff: &Diff) -> Vec<String> {
        Vec::new()
    }

    /// Applies the diff.
    async fn handle(
        &self,
        diff: &Diff,
        inputs: &ActionInputs,
        scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs>;

    /// Undoes a previously successful [`Action::handle`].
    async fn revert(
        &self,
        _diff: &Diff,
        _inputs: &ActionInputs,
        _outputs: &ActionOutputs,
        _scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs> {
        Ok(ActionOutputs::new())
    }

    /// Called once the transaction that applied the diff has committed.
    async fn post_transaction(&self, _diff: &Diff) -> Result<()> {
        Ok(())
    }
}
