//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, KeystoneError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{EngineConfig, StateBackend};

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(KeystoneError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            KeystoneError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let mut config = self.parse_yaml(&content, Some(path))?;
        self.resolve_paths(&mut config);
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            KeystoneError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for app: {}", config.app.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `KEYSTONE_<SECTION>_<KEY>` (e.g., `KEYSTONE_STATE_BUCKET`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is invalid.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Resolves a relative local state path against the base path.
    fn resolve_paths(&self, config: &mut EngineConfig) {
        if let (Some(base), Some(path)) = (&self.base_path, &config.state.path)
            && path.is_relative()
        {
            config.state.path = Some(base.join(path));
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeystoneError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `KEYSTONE_*` overrides read through `lookup`.
///
/// # Errors
///
/// Returns an error if `KEYSTONE_STATE_BACKEND` names an unknown backend.
pub fn apply_overrides(
    config: &mut EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(name) = lookup("KEYSTONE_APP_NAME") {
        debug!("Overriding app.name from environment");
        config.app.name = name;
    }

    if let Some(backend) = lookup("KEYSTONE_STATE_BACKEND") {
        debug!("Overriding state.backend from environment");
        config.state.backend = StateBackend::parse(&backend).ok_or_else(|| {
            ConfigError::validation(
                format!("Unknown state backend '{backend}'"),
                "KEYSTONE_STATE_BACKEND",
            )
        })?;
    }

    if let Some(path) = lookup("KEYSTONE_STATE_PATH") {
        debug!("Overriding state.path from environment");
        config.state.path = Some(PathBuf::from(path));
    }

    if let Some(bucket) = lookup("KEYSTONE_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = lookup("KEYSTONE_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }

    Ok(())
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["keystone.yaml", "keystone.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeystoneError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
