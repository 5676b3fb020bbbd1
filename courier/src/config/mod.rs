//! Configuration for the `courier` client.
//!
//! Layered with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! A missing default config file is not an error. An explicit `--config`
//! path that doesn't exist is.

use std::path::PathBuf;
use std::time::Duration;

use courier_proto::message::{Identity, MAX_BODY_SIZE};

use crate::ack::DEFAULT_ACK_TIMEOUT;
use crate::client::ClientSettings;

/// Errors that can occur when loading configuration.
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

    /// A setting required to talk to the server is missing.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    token: Option<String>,
    identity: Option<String>,
    ack_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    auto_mark_read: Option<bool>,
    max_body_size: Option<usize>,
    state_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Base HTTP URL of the server.
    pub server_url: String,
    /// Bearer credential.
    pub token: Option<String>,
    /// Identity the credential belongs to.
    pub identity: Option<String>,
    /// Acknowledgment window for real-time sends.
    pub ack_timeout: Duration,
    /// Timeout for connecting and for fallback requests.
    pub connect_timeout: Duration,
    /// Channel capacity for frame and event channels.
    pub channel_capacity: usize,

    // -- Chat --
    /// Mark incoming messages read as soon as they arrive.
    pub auto_mark_read: bool,
    /// Largest message body the client will try to send.
    pub max_body_size: usize,
    /// Where conversations are saved between runs. `None` disables saving.
    pub state_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            token: None,
            identity: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            auto_mark_read: true,
            max_body_size: MAX_BODY_SIZE,
            state_file: dirs::data_dir().map(|d| d.join("courier").join("state.json")),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.network.server_url.clone())
                .unwrap_or(defaults.server_url),
            token: cli.token.clone().or_else(|| file.network.token.clone()),
            identity: cli
                .identity
                .clone()
                .or_else(|| file.network.identity.clone()),
            ack_timeout: cli
                .ack_timeout_secs
                .or(file.network.ack_timeout_secs)
                .map_or(defaults.ack_timeout, Duration::from_secs),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            auto_mark_read: file.chat.auto_mark_read.unwrap_or(defaults.auto_mark_read),
            max_body_size: file.chat.max_body_size.unwrap_or(defaults.max_body_size),
            state_file: cli
                .state_file
                .clone()
                .or_else(|| file.chat.state_file.clone())
                .or(defaults.state_file),
        }
    }

    /// Builds [`ClientSettings`] for the chat client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no token or identity is set.
    pub fn to_settings(&self) -> Result<ClientSettings, ConfigError> {
        let token = self
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::Missing("token"))?;
        let identity = self
            .identity
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .ok_or(ConfigError::Missing("identity"))?;

        Ok(ClientSettings {
            server_url: self.server_url.clone(),
            token,
            identity: Identity::new(identity),
            ack_timeout: self.ack_timeout,
            connect_timeout: self.connect_timeout,
            channel_capacity: self.channel_capacity,
            auto_mark_read: self.auto_mark_read,
            max_body_size: self.max_body_size,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Direct messaging client with live delivery and an offline queue")]
pub struct CliArgs {
    /// Base HTTP URL of the server.
    #[arg(long, env = "COURIER_SERVER")]
    pub server_url: Option<String>,

    /// Bearer credential.
    #[arg(long, env = "COURIER_TOKEN")]
    pub token: Option<String>,

    /// Identity the credential belongs to.
    #[arg(long, env = "COURIER_IDENTITY")]
    pub identity: Option<String>,

    /// Acknowledgment window in seconds.
    #[arg(long)]
    pub ack_timeout_secs: Option<u64>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Where to save conversations between runs.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courier.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("courier").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
