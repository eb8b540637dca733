//! Actions: the pluggable units of work that apply diffs.
//!
//! Provider packages register actions per node kind. The transaction selects
//! every action accepting a diff, resolves the inputs it asks for and runs
//! them in registration order.

mod builtin;
mod inputs;
mod registry;
mod traits;

pub use builtin::{SharedOwnersAction, SHARED_OWNERS_ACTION};
pub use inputs::{InputResolver, METADATA_INPUT_PREFIX, RESOURCE_INPUT_PREFIX};
pub use registry::ActionRegistry;
pub use traits::{Action, ActionInputs, ActionOutputs, ActionScope};
