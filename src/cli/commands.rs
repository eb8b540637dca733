//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Keystone - operator tool for persisted infrastructure state.
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "KEYSTONE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Keystone app.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// App name (defaults to the directory name).
        #[arg(long)]
        name: Option<String>,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the engine configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Inspect and repair persisted state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Persisted documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DocumentKind {
    /// The committed model graph.
    Models,
    /// The committed resource graph.
    #[default]
    Resources,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show a persisted document.
    Show {
        /// Document to show.
        #[arg(value_enum, default_value = "resources")]
        document: DocumentKind,
    },

    /// Show the transaction journal.
    Journal {
        /// Number of most recent records to show.
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Show the current app lock.
    Lock,

    /// Release the app lock.
    Unlock {
        /// Lock ID to release (defaults to the current lock).
        #[arg(long)]
        lock_id: Option<String>,

        /// Release even if the lock has not expired.
        #[arg(long)]
        force: bool,
    },

    /// Clear dirty markers left by a failed transaction.
    ClearDirty {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_commands() {
        let cli = Cli::try_parse_from(["keystone", "--output", "json", "state", "show", "models"])
            .unwrap();
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Show {
                    document: DocumentKind::Models
                }
            }
        ));

        let cli = Cli::try_parse_from(["keystone", "state", "clear-dirty", "--yes"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::ClearDirty { yes: true }
            }
        ));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
