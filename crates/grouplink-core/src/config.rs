//! TOML-based configuration shared by the coordinator and member binaries.
//!
//! Reads and writes [`GroupLinkConfig`] from the platform-appropriate file:
//! - Windows:  `%APPDATA%\GroupLink\config.toml`
//! - Linux:    `~/.config/grouplink/config.toml`
//! - macOS:    `~/Library/Application Support/GroupLink/config.toml`
//!
//! An explicit path may be given instead (the binaries take it as their
//! first argument).
//!
//! # Serde default values
//!
//! Every section and every field carries a serde default, so a missing file,
//! an empty file, and a file written by an older version all load.  Example:
//!
//! ```toml
//! [node]
//! display_name = "kitchen-tablet"
//!
//! [network]
//! coordinator_port = 9999
//! connect_timeout_ms = 2000
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::adhoc::DEFAULT_COORDINATOR_PORT;
use crate::domain::device::Device;
use crate::net::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ENVELOPE_BYTES, DEFAULT_QUEUE_CAPACITY};

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
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupLinkConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Identity of this device and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Stable device id.  Generated on first run when absent.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ports, timeouts, and limits of the envelope transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Port the coordinator's listener binds.  0 picks a free port.
    #[serde(default = "default_coordinator_port")]
    pub coordinator_port: u16,
    /// Address every listener binds to.  `0.0.0.0` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Envelopes that may wait for one peer before new ones are rejected.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Largest envelope a listener accepts, in bytes.
    #[serde(default = "default_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
}

/// Group advertised by a coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    #[serde(default = "default_group_name")]
    pub name: String,
    /// Custom properties published with the group.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// How members look for coordinators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Coordinator reported by the static LAN transport.
    #[serde(default = "default_coordinator_address")]
    pub coordinator_address: SocketAddr,
}

impl GroupLinkConfig {
    /// The local device as described by `[node]`.
    pub fn local_device(&self) -> Device {
        Device::new(self.node.device_id.clone(), self.node.display_name.clone())
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Address the coordinator's listener binds.
    pub fn coordinator_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.coordinator_port)
    }

    /// Address a member's listener binds (any free port).
    pub fn member_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, 0)
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_id() -> String {
    Uuid::new_v4().to_string()
}
fn default_display_name() -> String {
    "grouplink-node".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_coordinator_port() -> u16 {
    DEFAULT_COORDINATOR_PORT
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}
fn default_outbound_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_max_envelope_bytes() -> usize {
    DEFAULT_MAX_ENVELOPE_BYTES
}
fn default_group_name() -> String {
    "grouplink".to_string()
}
fn default_discovery_timeout_ms() -> u64 {
    5000
}
fn default_coordinator_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_COORDINATOR_PORT)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            display_name: default_display_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            coordinator_port: default_coordinator_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_envelope_bytes: default_max_envelope_bytes(),
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            properties: BTreeMap::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            coordinator_address: default_coordinator_address(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from `path`.
///
/// On first run the file does not exist yet: the defaults, including a
/// freshly generated device id, are written to `path` and returned, so the
/// device id stays the same on every later run.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found"
/// or when the first-run file cannot be written, and [`ConfigError::Parse`]
/// if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<GroupLinkConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = GroupLinkConfig::default();
            save_config_to(path, &config)?;
            Ok(config)
        }
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Loads the config from the platform config file.
///
/// # Errors
///
/// See [`load_config_from`] and [`config_file_path`].
pub fn load_config() -> Result<GroupLinkConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &GroupLinkConfig) -> Result<(), ConfigError> {
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

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// See [`save_config_to`] and [`config_file_path`].
pub fn save_config(config: &GroupLinkConfig) -> Result<(), ConfigError> {
    save_config_to(&config_file_path()?, config)
}

/// Resolves the platform config directory including the `GroupLink` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("GroupLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("grouplink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("GroupLink"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
