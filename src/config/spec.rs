//! Configuration specification types.
//!
//! This module defines the structure of `keystone.yaml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

use crate::transaction::JOURNAL_LIMIT;

use super::validator::validate_app_name;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct EngineConfig {
    /// App settings.
    #[validate(nested)]
    pub app: AppConfig,
    /// State backend configuration.
    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,
    /// Transaction settings.
    #[serde(default)]
    #[validate(nested)]
    pub transaction: TransactionConfig,
}

/// App-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct AppConfig {
    /// App name, used to scope the persisted state.
    #[validate(length(min = 1, max = 63), custom(function = "validate_app_name"))]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory (for the local backend).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    #[validate(length(min = 3, max = 63))]
    pub bucket: Option<String>,
    /// S3 key prefix, defaults to the app name.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region, uses the AWS default if not specified.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// In-process storage, lost on exit.
    Memory,
    /// AWS S3-based state storage.
    S3,
}

impl StateBackend {
    /// Parses a backend name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "memory" => Some(Self::Memory),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Memory => write!(f, "memory"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

/// Transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct TransactionConfig {
    /// Number of journal records kept.
    #[serde(default = "default_journal_limit")]
    #[validate(range(min = 1, max = 10_000))]
    pub journal_limit: usize,
    /// Times to retry taking a busy app lock.
    #[serde(default)]
    #[validate(range(max = 10))]
    pub lock_retries: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            journal_limit: default_journal_limit(),
            lock_retries: 0,
        }
    }
}

const fn default_journal_limit() -> usize {
    JOURNAL_LIMIT
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the app name.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app: AppConfig {
                name: app_name.into(),
                description: None,
            },
            state: StateConfig::default(),
            transaction: TransactionConfig::default(),
        }
    }
}
