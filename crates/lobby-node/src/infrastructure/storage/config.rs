//! TOML-based configuration for a lobby node.
//!
//! The file is optional.  When it is absent every value falls back to its
//! default, and a partial file only overrides what it names:
//!
//! ```toml
//! [network]
//! discovery_port = 50000
//! session_port = 5555
//! bind_address = "0.0.0.0"
//! broadcast_address = "255.255.255.255"
//!
//! [timing]
//! beacon_interval_ms = 1000
//! lobby_timeout_ms = 3000
//! connect_timeout_ms = 5000
//!
//! [logging]
//! log_level = "info"
//! ```
//!
//! Default location:
//! - Windows:  `%APPDATA%\LanLobby\config.toml`
//! - Linux:    `~/.config/lan-lobby/config.toml`
//! - macOS:    `~/Library/Application Support/LanLobby/config.toml`

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lobby_core::protocol::{DEFAULT_BEACON_INTERVAL, DEFAULT_DISCOVERY_PORT, DEFAULT_SESSION_PORT, LOBBY_TIMEOUT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An address field is not a valid IP address.
    #[error("invalid {field} {value:?}: {source}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ports and addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// UDP port beacons are sent to and the registry listens on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP port a host listens on when none is given.
    #[serde(default = "default_session_port")]
    pub session_port: u16,
    /// Local address for the registry and the session listener.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Destination address for beacons.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
}

/// Intervals and timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Age after which a silent lobby is evicted.
    #[serde(default = "default_lobby_timeout_ms")]
    pub lobby_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_session_port() -> u16 {
    DEFAULT_SESSION_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_beacon_interval_ms() -> u64 {
    DEFAULT_BEACON_INTERVAL.as_millis() as u64
}
fn default_lobby_timeout_ms() -> u64 {
    LOBBY_TIMEOUT.as_millis() as u64
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            session_port: default_session_port(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: default_beacon_interval_ms(),
            lobby_timeout_ms: default_lobby_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl NetworkConfig {
    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        parse_ip("bind_address", &self.bind_address)
    }

    /// Where the registry listens.
    pub fn discovery_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.discovery_port))
    }

    /// Where beacons are sent.
    pub fn broadcast_target(&self) -> Result<SocketAddr, ConfigError> {
        let ip = parse_ip("broadcast_address", &self.broadcast_address)?;
        Ok(SocketAddr::new(ip, self.discovery_port))
    }

    /// Where a host listens for its joiner.  Port 0 picks an ephemeral port.
    pub fn session_bind_addr(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, port))
    }
}

impl TimingConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn lobby_timeout(&self) -> Duration {
        Duration::from_millis(self.lobby_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
        source,
    })
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path for this platform.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads a [`NodeConfig`] from `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &NodeConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LanLobby"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lan-lobby"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("LanLobby"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
