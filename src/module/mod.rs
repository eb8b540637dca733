//! Provider modules and the container that loads them.

mod container;
mod contract;

pub use container::ModuleContainer;
pub use contract::{Module, ModuleInputs, ModuleMetadata};
