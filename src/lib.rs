// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keystone
//!
//! A graph-based infrastructure-as-code engine with two-phase transactions.
//!
//! ## Overview
//!
//! Keystone keeps two persisted graphs per app:
//!
//! - **Models** describe what the operator wants, expressed by modules
//! - **Resources** describe what actually exists, built by actions
//!
//! A commit diffs the new model graph against the committed one, runs model
//! actions to derive the desired resources, diffs those against the
//! committed resources and applies them level by level. Resources are
//! marked dirty while their real-world state is unconfirmed, so an
//! interrupted transaction can be resumed or rolled back.
//!
//! ## Architecture
//!
//! 1. **Graph**: typed nodes, dependency edges and anchors
//! 2. **Overlay**: late binding of overlay nodes to their anchor parents
//! 3. **Planner**: diffs, dependency levels and execution plans
//! 4. **Action**: handlers selected per diff, with input resolution
//! 5. **Transaction**: the two-phase state machine, journal and hooks
//! 6. **State**: document and lock storage (local, S3, memory)
//!
//! ## Modules
//!
//! - [`graph`]: Node arena, contexts, dependencies and validation
//! - [`overlay`]: Anchor slots and overlay binding
//! - [`planner`]: Diff computation and execution planning
//! - [`action`]: Action trait, registry and input resolution
//! - [`module`]: Module contract and container
//! - [`transaction`]: Transaction state machine, hooks and journal
//! - [`serialization`]: Graph documents and class registry
//! - [`state`]: State storage backends
//! - [`config`]: Configuration parsing and validation
//! - [`engine`]: Facade tying everything together
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! app:
//!   name: shop
//!
//! state:
//!   backend: s3
//!   bucket: keystone-state
//!   prefix: shop/prod
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod action;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod module;
pub mod overlay;
pub mod planner;
pub mod serialization;
pub mod state;
pub mod transaction;

// ============================================================================
// Re-exports
// ============================================================================

pub use action::{Action, ActionInputs, ActionOutputs, ActionRegistry, ActionScope};
pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use engine::{Engine, PlanReport};
pub use error::{KeystoneError, Result};
pub use graph::{Graph, Node, NodeClass, NodeId, NodeKind, NodeSpec, StaticClass};
pub use module::{Module, ModuleContainer, ModuleInputs, ModuleMetadata};
pub use planner::{Diff, DiffAction, DiffMetadata, ExecutionPlan};
pub use serialization::{ClassRegistry, GraphSerializer};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
pub use transaction::{Transaction, TransactionContext, TransactionRecord, TransactionState};
