//! Configuration system for the Courier server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier-server/config.toml`)
//! 4. Compiled defaults

use std::collections::HashMap;
use std::path::PathBuf;

use courier_proto::message::{Identity, MAX_BODY_SIZE};

use crate::auth::TokenTable;
use crate::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::router::RouterConfig;
use crate::store::DEFAULT_MAX_QUEUE_SIZE;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the server.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
    auth: AuthFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    database_path: Option<PathBuf>,
    max_body_size: Option<usize>,
    max_queue_size: Option<usize>,
    ledger_capacity: Option<usize>,
    create_unknown_receivers: Option<bool>,
}

/// `[auth]` section: static bearer tokens mapped to identities.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    tokens: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier delivery server")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "COURIER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/courier-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path of the pending-queue database.
    #[arg(long, env = "COURIER_DB")]
    pub database: Option<PathBuf>,

    /// Keep pending queues in memory only (lost on restart).
    #[arg(long)]
    pub ephemeral: bool,

    /// Maximum message body size in bytes.
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Maximum queued messages per offline receiver.
    #[arg(long)]
    pub max_queue_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:8000`).
    pub bind_addr: String,
    /// Pending-queue database file; `None` keeps queues in memory.
    pub database_path: Option<PathBuf>,
    /// Maximum allowed message body size in bytes.
    pub max_body_size: usize,
    /// Maximum number of queued messages per offline receiver.
    pub max_queue_size: usize,
    /// Number of routed messages remembered for read receipts.
    pub ledger_capacity: usize,
    /// Whether sending to an unknown identity creates its record.
    pub create_unknown_receivers: bool,
    /// Static bearer tokens.
    pub tokens: HashMap<String, String>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_path: default_database_path(),
            max_body_size: MAX_BODY_SIZE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            create_unknown_receivers: true,
            tokens: HashMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: ServerConfigFile) -> Self {
        let defaults = Self::default();

        let database_path = if cli.ephemeral {
            None
        } else {
            cli.database
                .clone()
                .or(file.server.database_path)
                .or(defaults.database_path)
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            database_path,
            max_body_size: cli
                .max_body_size
                .or(file.server.max_body_size)
                .unwrap_or(defaults.max_body_size),
            max_queue_size: cli
                .max_queue_size
                .or(file.server.max_queue_size)
                .unwrap_or(defaults.max_queue_size),
            ledger_capacity: file
                .server
                .ledger_capacity
                .unwrap_or(defaults.ledger_capacity),
            create_unknown_receivers: file
                .server
                .create_unknown_receivers
                .unwrap_or(defaults.create_unknown_receivers),
            tokens: file.auth.tokens,
            log_level: cli.log_level.clone(),
        }
    }

    /// Router tunables derived from this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_body_size: self.max_body_size,
            create_unknown_receivers: self.create_unknown_receivers,
            ledger_capacity: self.ledger_capacity,
        }
    }

    /// The configured static tokens as a verifier.
    #[must_use]
    pub fn token_table(&self) -> TokenTable {
        self.tokens
            .iter()
            .map(|(token, identity)| (token.clone(), Identity::new(identity.as_str())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("courier-server").join("pending.db"))
}

/// Load and parse a TOML config file for the server.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("courier-server").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
