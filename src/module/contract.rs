//! The contract implemented by provider modules.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ConfigError, Result};
use crate::graph::{Graph, NodeId};
use crate::transaction::TransactionHook;

/// Metadata registered by modules, keyed by module id.
///
/// Actions reach it through `metadata.<module>.<key>` inputs.
pub type ModuleMetadata = BTreeMap<String, Map<String, Value>>;

/// Inputs handed to a module when it is loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleInputs {
    values: Map<String, Value>,
}

impl ModuleInputs {
    /// Creates empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object. Non-object values produce empty inputs.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }

    /// Adds an input.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Returns a required input decoded as `T`.
    ///
    /// # Errors
    ///
    /// Returns a config validation error if the input is missing or has
    /// the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ConfigError::validation("Missing module input", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::validation(format!("Invalid module input: {e}"), key).into())
    }

    /// Returns an optional input decoded as `T`.
    ///
    /// # Errors
    ///
    /// Returns a config validation error if the input has the wrong shape.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if self.values.contains_key(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Raw input values.
    #[must_use]
    pub const fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// A provider module: builds model nodes and contributes metadata and hooks.
pub trait Module: Send + Sync {
    /// Unique module id.
    fn module_id(&self) -> &str;

    /// Adds the module's model nodes to `graph`, returning the nodes it
    /// created.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are invalid or a mutation fails.
    fn on_init(&self, inputs: &ModuleInputs, graph: &mut Graph) -> Result<Vec<NodeId>>;

    /// Metadata exposed to actions under `metadata.<module_id>.<key>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are invalid.
    fn register_metadata(&self, _inputs: &ModuleInputs) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }

    /// Transaction hooks contributed by the module.
    fn register_hooks(&self) -> Vec<Arc<dyn TransactionHook>> {
        Vec::new()
    }
}
