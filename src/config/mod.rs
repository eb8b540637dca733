//! Configuration module for the Keystone engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `keystone.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of configuration values

mod parser;
mod spec;
mod validator;

pub use parser::{apply_overrides, find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{AppConfig, EngineConfig, StateBackend, StateConfig, TransactionConfig};
pub use self::validator::{validate_app_name, ConfigValidator, FieldIssue, ValidationResult};
