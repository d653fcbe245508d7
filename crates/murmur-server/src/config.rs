//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults (`MURMUR_HOST` / `MURMUR_PORT` seed host and port)
//! - `MURMUR_CONFIG`, or else the first TOML file found among the default paths
//! - Environment variables (`MURMUR__LIMITS__MAX_CONNECTIONS=500`)

use anyhow::{Context, Result};
use murmur_core::{HubConfig, DEFAULT_MAX_MESSAGE_LENGTH, DEFAULT_TYPING_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const CONFIG_PATHS: [&str; 3] = [
    "murmur.toml",
    "/etc/murmur/murmur.toml",
    "~/.config/murmur/murmur.toml",
];

const CONFIG_ENV: &str = "MURMUR_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Typing indicator configuration.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Room state configuration.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum size of one WebSocket frame in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum message text length in bytes.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a connection is dropped, in milliseconds.
    /// Also bounds how long a client may take to send `connect`.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// How long clients show an indicator without renewal, in milliseconds.
    #[serde(default = "default_typing_timeout")]
    pub timeout_ms: u64,
}

/// Room state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Drop in-memory room state once the last connection leaves.
    #[serde(default = "default_true")]
    pub retire_empty: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("MURMUR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("MURMUR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_typing_timeout() -> u64 {
    DEFAULT_TYPING_TIMEOUT.as_millis() as u64
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            typing: TypingConfig::default(),
            rooms: RoomsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_message_length: default_max_message_length(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_typing_timeout(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self { retire_empty: true }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// `MURMUR_CONFIG` names an explicit file that replaces the default
    /// search.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            return Self::from_file(shellexpand::tilde(&explicit).as_ref());
        }

        let path = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(path.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.exists(), "Config file not found: {}", path.display());
        Self::layered(Some(path))
    }

    fn layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Toml));
        }
        let layered = builder
            .add_source(
                ::config::Environment::with_prefix("MURMUR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let config: Config = layered.try_deserialize().with_context(|| match path {
            Some(path) => format!("Invalid configuration in {}", path.display()),
            None => "Invalid configuration in environment".to_string(),
        })?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub(&self) -> HubConfig {
        HubConfig {
            max_message_length: self.limits.max_message_length,
            retire_empty_rooms: self.rooms.retire_empty,
        }
    }
}
