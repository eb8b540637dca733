//! Input resolution for actions.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SelectionError};
use crate::graph::{Graph, Node};
use crate::module::ModuleMetadata;
use crate::planner::{Diff, DiffMetadata};

use super::traits::{ActionInputs, ActionOutputs};

/// Prefix of inputs naming module metadata.
pub const METADATA_INPUT_PREFIX: &str = "metadata.";

/// Prefix of inputs naming a desired resource.
pub const RESOURCE_INPUT_PREFIX: &str = "resource.";

/// Looks up input names for one action invocation.
///
/// Names resolve against, in order: outputs already produced for the
/// current diff, outputs of diffs applied earlier in the same commit
/// (latest first), module metadata and desired resources.
#[derive(Debug, Clone, Copy)]
pub struct InputResolver<'a> {
    history: &'a [DiffMetadata],
    metadata: &'a ModuleMetadata,
    resources: &'a Graph,
}

impl<'a> InputResolver<'a> {
    /// Creates a resolver over the given commit history.
    #[must_use]
    pub const fn new(
        history: &'a [DiffMetadata],
        metadata: &'a ModuleMetadata,
        resources: &'a Graph,
    ) -> Self {
        Self {
            history,
            metadata,
            resources,
        }
    }

    /// Resolves every name requested by `action_name` for `diff`.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedInput` for the first name that cannot be found.
    pub fn resolve(
        &self,
        action_name: &str,
        diff: &Diff,
        names: &[String],
        own: &ActionOutputs,
    ) -> Result<ActionInputs> {
        let mut inputs = ActionInputs::new();
        for name in names {
            let value = self.lookup(name, own).ok_or_else(|| SelectionError::UnresolvedInput {
                action_name: action_name.to_string(),
                context: diff.context().to_string(),
                input: name.clone(),
            })?;
            debug!("Resolved input {name} for {action_name}");
            inputs.insert(name.clone(), value);
        }
        Ok(inputs)
    }

    fn lookup(&self, name: &str, own: &ActionOutputs) -> Option<Value> {
        if let Some(value) = own.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self
            .history
            .iter()
            .rev()
            .filter(|m| m.applied)
            .find_map(|m| m.outputs.get(name))
        {
            return Some(value.clone());
        }
        if let Some(path) = name.strip_prefix(METADATA_INPUT_PREFIX) {
            let (module, key) = path.split_once('.')?;
            return self.metadata.get(module)?.get(key).cloned();
        }
        if let Some(id) = name.strip_prefix(RESOURCE_INPUT_PREFIX) {
            return self.resource(id).map(|node| node.to_value());
        }
        None
    }

    /// Finds a resource by context, falling back to its identity.
    fn resource(&self, id: &str) -> Option<&Node> {
        self.resources.find(id).or_else(|| {
            self.resources
                .nodes()
                .find(|node| node.kind().is_resource() && node.identity() == id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeSpec, StaticClass};
    use crate::planner::DiffAction;
    use crate::serialization::ClassRegistry;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn resources() -> Graph {
        let mut classes = ClassRegistry::new();
        classes
            .register(StaticClass::resource("@example", "vpc", "vpcId"))
            .unwrap();
        let mut graph = Graph::new(Arc::new(classes));
        let vpc = graph
            .add_node(NodeSpec::new("@example/vpc", "vpc-1").property("cidr", "10.0.0.0/16"))
            .unwrap();
        graph
            .set_response(vpc, "arn", json!("arn:vpc-1"))
            .unwrap();
        graph
    }

    fn applied(diff: Diff, key: &str, value: Value) -> DiffMetadata {
        let mut metadata = DiffMetadata::new(diff, vec!["create".into()], 0);
        metadata.outputs.insert(key.to_string(), value);
        metadata.mark_applied(0);
        metadata
    }

    #[test]
    fn test_resolution_order() {
        let graph = resources();
        let node = graph.find("@example/vpc=vpc-1").unwrap();
        let diff = Diff::new(node, DiffAction::Add, "vpcId", json!("vpc-1"));

        let history = vec![
            applied(diff.clone(), "vpcArn", json!("old")),
            applied(diff.clone(), "vpcArn", json!("new")),
        ];
        let mut module = Map::new();
        module.insert("region".into(), json!("eu-west-1"));
        let mut metadata = ModuleMetadata::new();
        metadata.insert("network".into(), module);

        let resolver = InputResolver::new(&history, &metadata, &graph);
        let names = vec![
            "vpcArn".to_string(),
            "metadata.network.region".to_string(),
            "resource.vpc-1".to_string(),
        ];
        let inputs = resolver
            .resolve("subnet", &diff, &names, &ActionOutputs::new())
            .unwrap();

        assert_eq!(inputs["vpcArn"], json!("new"));
        assert_eq!(inputs["metadata.network.region"], json!("eu-west-1"));
        assert_eq!(inputs["resource.vpc-1"]["response"]["arn"], json!("arn:vpc-1"));

        let mut own = ActionOutputs::new();
        own.insert("vpcArn".into(), json!("own"));
        let inputs = resolver.resolve("subnet", &diff, &names[..1], &own).unwrap();
        assert_eq!(inputs["vpcArn"], json!("own"));
    }

    #[test]
    fn test_unapplied_history_is_ignored() {
        let graph = resources();
        let node = graph.find("@example/vpc=vpc-1").unwrap();
        let diff = Diff::new(node, DiffAction::Add, "vpcId", json!("vpc-1"));
        let mut pending = DiffMetadata::new(diff.clone(), vec![], 0);
        pending.outputs.insert("vpcArn".into(), json!("x"));
        let history = vec![pending];
        let metadata = ModuleMetadata::new();

        let err = InputResolver::new(&history, &metadata, &graph)
            .resolve("subnet", &diff, &["vpcArn".to_string()], &ActionOutputs::new())
            .unwrap_err();
        assert!(err.to_string().contains("vpcArn"));
    }
}
