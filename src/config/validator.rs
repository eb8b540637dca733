//! Configuration validation for engine configs.
//!
//! Field-level rules come from the `validator` derive on the configuration types;
//! cross-field rules for the state backend live here.

use std::collections::BTreeMap;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::error::{ConfigError, KeystoneError, Result};

use super::spec::{EngineConfig, StateBackend, StateConfig};

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all issues found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<FieldIssue>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = Self::inspect(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            return Ok(result);
        }

        let first = result.errors.remove(0);
        Err(KeystoneError::Config(ConfigError::ValidationError {
            message: first.message,
            field: Some(first.field),
        }))
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn inspect(config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            let mut fields = BTreeMap::new();
            flatten("", &errors, &mut fields);
            result.errors.extend(
                fields
                    .into_iter()
                    .map(|(field, message)| FieldIssue { field, message }),
            );
        }
        Self::validate_state(&config.state, &mut result);
        result
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(FieldIssue {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if let Some(path) = &state.path
                    && path.is_file()
                {
                    result.errors.push(FieldIssue {
                        field: String::from("state.path"),
                        message: format!("State path {} is a file", path.display()),
                    });
                }
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
            StateBackend::Memory => {
                result
                    .warnings
                    .push(String::from("Memory backend keeps no state between runs"));
            }
        }
    }
}

/// Flattens nested derive errors into `path -> message`.
fn flatten(prefix: &str, errors: &ValidationErrors, out: &mut BTreeMap<String, String>) {
    for (field, kind) in errors.errors() {
        let path = format!("{prefix}{field}");
        match kind {
            ValidationErrorsKind::Field(failures) => {
                let message = failures
                    .iter()
                    .map(|f| {
                        f.message
                            .as_ref()
                            .map_or_else(|| format!("failed '{}' check", f.code), ToString::to_string)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                out.insert(path, message);
            }
            ValidationErrorsKind::Struct(nested) => flatten(&format!("{path}."), nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    flatten(&format!("{path}[{index}]."), nested, out);
                }
            }
        }
    }
}

/// Custom rule for `app.name`.
///
/// # Errors
///
/// Returns a validation error if the name is not a lowercase slug.
pub fn validate_app_name(name: &str) -> std::result::Result<(), validator::ValidationError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        let mut error = validator::ValidationError::new("app_name");
        error.message = Some(
            format!("App name '{name}' is invalid. Must be lowercase alphanumeric with hyphens.")
                .into(),
        );
        Err(error)
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
