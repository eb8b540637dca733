//! Keystone CLI entrypoint.
//!
//! This is the main entrypoint for the keystone command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use keystone::cli::{Cli, Commands, DocumentKind, OutputFormatter, StateCommands};
use keystone::config::{
    find_config_file, validate_app_name, ConfigParser, ConfigValidator, EngineConfig,
    StateBackend,
};
use keystone::error::{ConfigError, KeystoneError, Result, StateError};
use keystone::serialization::{Document, MODELS_DOCUMENT, RESOURCES_DOCUMENT};
use keystone::state::{self, StateStore, STATE_DIR};
use keystone::transaction::Journal;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Configuration template written by `keystone init`.
const CONFIG_TEMPLATE: &str = r"# Keystone engine configuration
app:
  name: {name}
  description: Managed by keystone

state:
  # local | s3 | memory
  backend: local
  path: .keystone
  # bucket: my-keystone-state
  # prefix: {name}
  # region: eu-west-1

transaction:
  journal_limit: 100
  lock_retries: 3
";

/// Environment template written by `keystone init`.
const ENV_TEMPLATE: &str = "# Overrides applied on top of keystone.yaml
# KEYSTONE_STATE_BACKEND=s3
# KEYSTONE_STATE_BUCKET=my-keystone-state
# KEYSTONE_STATE_PREFIX=
# AWS_REGION=eu-west-1
";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, name, force } => cmd_init(&path, name, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new app.
fn cmd_init(path: &Path, name: Option<String>, force: bool) -> Result<()> {
    info!("Initializing new Keystone app in: {}", path.display());

    let config_path = path.join("keystone.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    let name = match name {
        Some(name) => name,
        None => default_app_name(path)?,
    };
    validate_app_name(&name).map_err(|e| {
        ConfigError::validation(
            e.message.map_or_else(|| e.code.to_string(), |m| m.to_string()),
            "app.name",
        )
    })?;

    // Create directory if needed
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, CONFIG_TEMPLATE.replace("{name}", &name))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, ENV_TEMPLATE)?;
    eprintln!("Created: {}", env_path.display());

    // Write/update .gitignore
    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Keystone")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nApp '{name}' initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit keystone.yaml to choose a state backend");
    eprintln!("  2. Run 'keystone validate' to check your configuration");
    eprintln!("  3. Run 'keystone state show' to inspect committed state");

    Ok(())
}

/// Derives an app name from the target directory.
fn default_app_name(path: &Path) -> Result<String> {
    let dir = if path == Path::new(".") {
        std::env::current_dir()?
    } else {
        path.to_path_buf()
    };

    let name: String = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let name = name.trim_matches('-').to_string();

    if validate_app_name(&name).is_ok() {
        Ok(name)
    } else {
        warn!("Cannot derive an app name from {}, using 'app'", dir.display());
        Ok(String::from("app"))
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::inspect(&config);
    println!("{}", formatter.format_validation(&config, &result, show_warnings));

    if result.is_valid() {
        Ok(())
    } else {
        ConfigValidator::new().validate(&config).map(|_| ())
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, store) = load_config_and_store(config_path).await?;
    debug!(
        "Using {} state backend for app {}",
        store.backend_type(),
        config.app.name
    );

    match command {
        StateCommands::Show { document } => {
            let name = match document {
                DocumentKind::Models => MODELS_DOCUMENT,
                DocumentKind::Resources => RESOURCES_DOCUMENT,
            };
            let loaded = load_document(store.as_ref(), name).await?;
            println!("{}", formatter.format_document(name, &loaded));
        }
        StateCommands::Journal { limit } => {
            let journal = Journal::load(store.as_ref()).await?;
            println!("{}", formatter.format_journal(journal.records(), limit));
        }
        StateCommands::Lock => {
            let lock = store.lock_info().await?;
            println!("{}", formatter.format_lock(lock.as_ref()));
        }
        StateCommands::Unlock { lock_id, force } => {
            let message = cmd_unlock(store.as_ref(), lock_id, force).await?;
            println!("{}", formatter.format_message("success", &message));
        }
        StateCommands::ClearDirty { yes } => {
            if !yes && !confirm("Clear dirty markers? Only do this once the resources are verified. [y/N]: ")? {
                eprintln!("Clear cancelled.");
                return Ok(());
            }
            let cleared = cmd_clear_dirty(store.as_ref()).await?;
            let message = if cleared.is_empty() {
                String::from("No dirty resources.")
            } else {
                format!("Cleared {} dirty markers: {}", cleared.len(), cleared.join(", "))
            };
            println!("{}", formatter.format_message("success", &message));
        }
    }

    Ok(())
}

/// Releases the app lock.
async fn cmd_unlock(store: &dyn StateStore, lock_id: Option<String>, force: bool) -> Result<String> {
    let Some(current) = store.lock_info().await? else {
        return Ok(String::from("App is not locked."));
    };

    if let Some(id) = lock_id
        && id != current.lock_id
    {
        return Err(StateError::LockNotHeld { lock_id: id }.into());
    }

    if !force && !current.is_expired() {
        return Err(current.conflict());
    }

    store.unlock_app(&current.lock_id).await?;
    info!("Released lock {} held by {}", current.lock_id, current.holder);
    Ok(format!("Released lock held by {}.", current.holder))
}

/// Clears dirty markers in the resource document under the app lock.
async fn cmd_clear_dirty(store: &dyn StateStore) -> Result<Vec<String>> {
    let lock = store.lock_app().await?;

    let result = async {
        let mut document = load_document(store, RESOURCES_DOCUMENT).await?;
        let cleared = document.clear_dirty();
        if !cleared.is_empty() {
            store
                .save_state(RESOURCES_DOCUMENT, &document.to_bytes()?)
                .await?;
            for context in &cleared {
                warn!("Cleared dirty marker on {context}");
            }
        }
        Ok(cleared)
    }
    .await;

    store.unlock_app(&lock.lock_id).await?;
    result
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loads a graph document, treating a missing one as empty.
async fn load_document(store: &dyn StateStore, name: &str) -> Result<Document> {
    match store.get_state(name).await {
        Ok(bytes) => Document::from_bytes(name, &bytes),
        Err(KeystoneError::State(StateError::NoState { .. })) => Ok(Document::new()),
        Err(e) => Err(e),
    }
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory containing the configuration file.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads configuration and opens the configured state store.
async fn load_config_and_store(
    config_path: Option<&PathBuf>,
) -> Result<(EngineConfig, Box<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_dir(&config_file);
    let parser = ConfigParser::new().with_base_path(base);
    parser.load_dotenv()?;

    let mut config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    if config.state.backend == StateBackend::Local && config.state.path.is_none() {
        config.state.path = Some(base.join(STATE_DIR));
    }

    let store = state::open(&config.state, &config.app.name).await?;
    Ok((config, store))
}
