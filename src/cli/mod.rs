//! CLI module for the Keystone operator tool.
//!
//! This module provides the command-line interface for inspecting and
//! repairing persisted state.

mod commands;
mod output;

pub use commands::{Cli, Commands, DocumentKind, OutputFormat, StateCommands};
pub use output::OutputFormatter;
