//! TOML-based node configuration.
//!
//! The default location is platform dependent:
//! - Windows:  `%APPDATA%\HybridNet\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/hybridnet/config.toml` (or `~/.config/...`)
//! - macOS:    `~/Library/Application Support/HybridNet/config.toml`
//!
//! Example:
//!
//! ```toml
//! [network]
//! bind_address = "0.0.0.0"
//! tcp_port = 9000
//! accept_connections = true
//! udp_port = 9001
//! connect_timeout_ms = 7000
//!
//! [reliability]
//! ping_timeout_ms = 500
//! healthy_interval_secs = 30
//!
//! [node]
//! greeting = "echo"
//! log_level = "info"
//! ```
//!
//! Every field carries a serde default, so a partial (or empty) file is valid
//! and a missing file simply yields [`NodeConfig::default()`].

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hybrid_core::{InvalidReliabilityConfig, ReliabilityConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::ListenConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// `bind_address` is not an IP address.
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),

    /// A `[reliability]` value is out of range.
    #[error("invalid [reliability] section: {0}")]
    InvalidReliability(#[from] InvalidReliabilityConfig),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level node configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub node: NodeSection,
}

/// Socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// IP address both sockets bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP listening port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// `false` runs the node without a TCP listener (outbound only).
    #[serde(default = "default_true")]
    pub accept_connections: bool,
    /// Requested UDP port; `0` lets the OS choose.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Peers to connect to at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

/// Node identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Greeting of the echo handler this node registers.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Interval between pings sent to every connection; `0` disables them.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_tcp_port() -> u16 {
    9000
}
fn default_true() -> bool {
    true
}
fn default_udp_port() -> u16 {
    9001
}
fn default_connect_timeout_ms() -> u64 {
    7_000
}
fn default_greeting() -> String {
    "echo".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ping_interval_ms() -> u64 {
    1_000
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            tcp_port: default_tcp_port(),
            accept_connections: default_true(),
            udp_port: default_udp_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            peers: Vec::new(),
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            log_level: default_log_level(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl NodeConfig {
    /// Converts the file settings into what the manager consumes.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidBindAddress`] if `bind_address` does not parse
    /// - [`ConfigError::InvalidReliability`] if the `[reliability]` timings
    ///   are out of range
    pub fn listen_config(&self) -> Result<ListenConfig, ConfigError> {
        self.reliability.validate()?;
        let bind_address: IpAddr = self
            .network
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.network.bind_address.clone()))?;
        Ok(ListenConfig {
            bind_address,
            tcp_port: self.network.accept_connections.then_some(self.network.tcp_port),
            udp_port: self.network.udp_port,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            reliability: self.reliability.clone(),
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Full path of the platform default config file.
///
/// # Errors
///
/// [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined from the environment.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found", and
/// [`ConfigError::Parse`] if the TOML is malformed.
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
/// [`ConfigError::Io`] for file-system failures or
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
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("HybridNet"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("hybridnet"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("HybridNet")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
