//! Explicit, ordered registry of node classes.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StructuralError};
use crate::graph::NodeClass;

/// Node classes keyed by discriminator (`<package>/<type>`).
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<Arc<dyn NodeClass>>,
    by_name: HashMap<String, usize>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateClass` if the discriminator is taken.
    pub fn register(&mut self, class: impl NodeClass + 'static) -> Result<()> {
        self.register_shared(Arc::new(class))
    }

    /// Registers an already shared class.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateClass` if the discriminator is taken.
    pub fn register_shared(&mut self, class: Arc<dyn NodeClass>) -> Result<()> {
        let class_name = class.class_name();
        if self.by_name.contains_key(&class_name) {
            return Err(StructuralError::DuplicateClass { class_name }.into());
        }
        debug!("Registered node class {class_name} ({})", class.kind());
        self.by_name.insert(class_name, self.classes.len());
        self.classes.push(class);
        Ok(())
    }

    /// Looks up a class.
    ///
    /// # Errors
    ///
    /// Returns `UnknownClass` if the discriminator is not registered.
    pub fn class(&self, class_name: &str) -> Result<&Arc<dyn NodeClass>> {
        self.by_name
            .get(class_name)
            .and_then(|&index| self.classes.get(index))
            .ok_or_else(|| {
                StructuralError::UnknownClass {
                    class_name: class_name.to_string(),
                }
                .into()
            })
    }

    /// Returns true if the discriminator is registered.
    #[must_use]
    pub fn contains(&self, class_name: &str) -> bool {
        self.by_name.contains_key(class_name)
    }

    /// Discriminators in registration order.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.classes.iter().map(|class| class.class_name())
    }

    /// Number of registered classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
