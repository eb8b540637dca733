//! Loading registered modules into a model graph.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::graph::{Graph, NodeId};
use crate::transaction::{HookSet, TransactionHook};

use super::contract::{Module, ModuleInputs, ModuleMetadata};

/// Modules in registration order, with what they produced once loaded.
#[derive(Default)]
pub struct ModuleContainer {
    modules: Vec<(Arc<dyn Module>, ModuleInputs)>,
    metadata: ModuleMetadata,
    hooks: Vec<Arc<dyn TransactionHook>>,
    roots: BTreeMap<String, Vec<NodeId>>,
}

impl std::fmt::Debug for ModuleContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContainer")
            .field("modules", &self.module_ids().collect::<Vec<_>>())
            .field("metadata", &self.metadata)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl ModuleContainer {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module with its inputs.
    ///
    /// # Errors
    ///
    /// Returns a config validation error if the module id is taken.
    pub fn register(&mut self, module: Arc<dyn Module>, inputs: ModuleInputs) -> Result<()> {
        let id = module.module_id();
        if self.modules.iter().any(|(m, _)| m.module_id() == id) {
            return Err(ConfigError::validation("Module already registered", id).into());
        }
        debug!("Registered module {id}");
        self.modules.push((module, inputs));
        Ok(())
    }

    /// Runs every module against `graph` in registration order, collecting
    /// metadata and hooks. Returns the ids of all created nodes.
    ///
    /// # Errors
    ///
    /// Returns the first module error. Earlier modules stay loaded.
    pub fn load(&mut self, graph: &mut Graph) -> Result<Vec<NodeId>> {
        self.metadata.clear();
        self.hooks.clear();
        self.roots.clear();

        let mut created = Vec::new();
        for (module, inputs) in &self.modules {
            let id = module.module_id().to_string();
            info!("Loading module {id}");

            let nodes = module.on_init(inputs, graph)?;
            let metadata = module.register_metadata(inputs)?;
            let hooks = module.register_hooks();
            debug!(
                "Module {id}: {} nodes, {} metadata keys, {} hooks",
                nodes.len(),
                metadata.len(),
                hooks.len()
            );

            created.extend(nodes.iter().copied());
            self.roots.insert(id.clone(), nodes);
            self.metadata.insert(id, metadata);
            self.hooks.extend(hooks);
        }
        Ok(created)
    }

    /// Metadata collected by the last [`ModuleContainer::load`].
    #[must_use]
    pub const fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// Hooks collected by the last [`ModuleContainer::load`].
    #[must_use]
    pub fn hooks(&self) -> HookSet {
        HookSet::new(self.hooks.clone())
    }

    /// Nodes created by a module during the last load.
    #[must_use]
    pub fn roots(&self, module_id: &str) -> &[NodeId] {
        self.roots.get(module_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Registered module ids, in order.
    pub fn module_ids(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|(m, _)| m.module_id())
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if no module is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeSpec, StaticClass};
    use crate::serialization::ClassRegistry;
    use serde_json::{json, Map, Value};

    struct AppModule;

    impl Module for AppModule {
        fn module_id(&self) -> &str {
            "app"
        }

        fn on_init(&self, inputs: &ModuleInputs, graph: &mut Graph) -> Result<Vec<NodeId>> {
            let name: String = inputs.get("name")?;
            let app = graph.add_node(NodeSpec::new("@example/app", name))?;
            Ok(vec![app])
        }

        fn register_metadata(&self, inputs: &ModuleInputs) -> Result<Map<String, Value>> {
            let mut metadata = Map::new();
            metadata.insert("name".into(), json!(inputs.get::<String>("name")?));
            Ok(metadata)
        }
    }

    fn graph() -> Graph {
        let mut classes = ClassRegistry::new();
        classes
            .register(StaticClass::model("@example", "app", "name"))
            .unwrap();
        Graph::new(Arc::new(classes))
    }

    #[test]
    fn test_load_collects_nodes_and_metadata() {
        let mut container = ModuleContainer::new();
        container
            .register(Arc::new(AppModule), ModuleInputs::new().with("name", "test"))
            .unwrap();

        let mut graph = graph();
        let created = container.load(&mut graph).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(container.roots("app"), created.as_slice());
        assert!(graph.contains("app=test"));
        assert_eq!(container.metadata()["app"]["name"], json!("test"));
        assert!(container.hooks().is_empty());
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let mut container = ModuleContainer::new();
        container
            .register(Arc::new(AppModule), ModuleInputs::new())
            .unwrap();
        assert!(container
            .register(Arc::new(AppModule), ModuleInputs::new())
            .is_err());
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn test_missing_input_fails_load() {
        let mut container = ModuleContainer::new();
        container
            .register(Arc::new(AppModule), ModuleInputs::new())
            .unwrap();
        assert!(container.load(&mut graph()).is_err());
    }
}
