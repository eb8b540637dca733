//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! persisted state to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{EngineConfig, ValidationResult};
use crate::serialization::Document;
use crate::state::LockInfo;
use crate::transaction::{TransactionRecord, TransactionState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Document entry row for table display.
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Context")]
    context: String,
    #[tabled(rename = "Class")]
    class: String,
    #[tabled(rename = "Deps")]
    dependencies: usize,
    #[tabled(rename = "Dirty")]
    dirty: String,
}

/// Journal record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Models")]
    models: usize,
    #[tabled(rename = "Applied")]
    applied: usize,
    #[tabled(rename = "Error")]
    error: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a persisted document.
    #[must_use]
    pub fn format_document(&self, name: &str, document: &Document) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(document).unwrap_or_default(),
            OutputFormat::Text => Self::format_document_text(name, document),
        }
    }

    fn format_document_text(name: &str, document: &Document) -> String {
        let mut output = format!("\n{} ({} nodes)\n\n", name.bold(), document.len());

        if document.is_empty() {
            output.push_str("   Nothing committed yet.\n");
            return output;
        }

        let rows: Vec<EntryRow> = document
            .entries()
            .map(|(context, entry)| EntryRow {
                context: context.clone(),
                class: entry.class_name.clone(),
                dependencies: entry.payload.dependencies.len(),
                dirty: if entry.payload.dirty {
                    "dirty".red().to_string()
                } else {
                    String::new()
                },
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let dirty = document.dirty_contexts();
        if !dirty.is_empty() {
            let _ = write!(
                output,
                "\n{} {} dirty resources. Run 'keystone state clear-dirty' once they are verified.\n",
                "⚠".yellow(),
                dirty.len()
            );
        }

        output
    }

    /// Formats the most recent journal records, newest first.
    #[must_use]
    pub fn format_journal(&self, records: &[TransactionRecord], limit: usize) -> String {
        let recent: Vec<&TransactionRecord> = records.iter().rev().take(limit).collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&recent).unwrap_or_default(),
            OutputFormat::Text => {
                if recent.is_empty() {
                    return String::from("No transactions recorded.\n");
                }

                let rows: Vec<RecordRow> = recent
                    .iter()
                    .map(|record| RecordRow {
                        id: Self::truncate(&record.id, 8),
                        started: record.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        status: Self::format_status(record.status),
                        models: record.model_diffs.len(),
                        applied: record.applied.len(),
                        error: record
                            .error
                            .as_deref()
                            .map(|e| Self::truncate(e, 40))
                            .unwrap_or_default(),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                let _ = write!(
                    output,
                    "\n\nShowing {} of {} records.\n",
                    recent.len(),
                    records.len()
                );
                output
            }
        }
    }

    /// Formats the current app lock.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&lock).unwrap_or_default(),
            OutputFormat::Text => match lock {
                None => format!("{} App is not locked.\n", "✓".green()),
                Some(lock) => {
                    let mut output = String::new();
                    let state = if lock.is_expired() {
                        "expired".yellow().to_string()
                    } else {
                        "held".red().to_string()
                    };
                    let _ = writeln!(output, "\n🔒 Lock {state}\n");
                    let _ = writeln!(output, "   ID: {}", lock.lock_id);
                    let _ = writeln!(output, "   Holder: {}", lock.holder);
                    let _ = writeln!(output, "   Acquired: {}", lock.acquired_at);
                    let _ = writeln!(
                        output,
                        "   Expires: {} ({}s remaining)",
                        lock.expires_at,
                        lock.remaining_secs()
                    );
                    output
                }
            },
        }
    }

    /// Formats a validation result with a short configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &EngineConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "app": config.app.name,
                    "backend": config.state.backend.to_string(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid!\n", "✓".green())
                } else {
                    format!(
                        "{} Configuration has {} errors:\n",
                        "✗".red(),
                        result.error_count()
                    )
                };

                for issue in &result.errors {
                    let _ = writeln!(output, "   - {issue}");
                }

                if show_warnings && result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   App: {}", config.app.name);
                let _ = writeln!(output, "   State backend: {}", config.state.backend);
                let _ = writeln!(
                    output,
                    "   Journal limit: {}",
                    config.transaction.journal_limit
                );
                output
            }
        }
    }

    /// Formats the outcome of a state mutation.
    #[must_use]
    pub fn format_message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => match status {
                "success" => format!("{} {message}", "✓".green()),
                "warning" => format!("{} {message}", "⚠".yellow()),
                _ => format!("{} {message}", "✗".red()),
            },
        }
    }

    /// Formats a transaction state with color.
    fn format_status(state: TransactionState) -> String {
        match state {
            TransactionState::Committed => state.as_str().green().to_string(),
            TransactionState::Failed => state.as_str().red().to_string(),
            TransactionState::Aborted => state.as_str().dimmed().to_string(),
            _ => state.as_str().yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
