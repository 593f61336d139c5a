//! TOML-based configuration persistence for peerlink nodes.
//!
//! The default location is the platform config directory:
//! - Windows:  `%APPDATA%\peerlink\config.toml`
//! - Linux:    `~/.config/peerlink/config.toml`
//! - macOS:    `~/Library/Application Support/peerlink/config.toml`
//!
//! Example file:
//!
//! ```toml
//! [node]
//! log_level = "info"
//! heartbeat_interval_ms = 10000
//! gc_interval_ms = 120000
//! tick_interval_ms = 3000
//! base_port = 8000
//! require_reply_target = false
//!
//! [network]
//! bus_address = "127.0.0.1:24900"
//! prefix = "orders"
//! interface = "192.168.1.20"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]`, so a partial file (or an
//! empty one) is valid and missing fields take the documented defaults.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::heartbeat::HeartbeatIntervals;
use crate::application::peer_node::NodeOptions;
use crate::infrastructure::host::resolve_host;

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

    /// `network.interface` is not an IP address.
    #[error("invalid network interface address {0:?}")]
    InvalidInterface(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
}

/// Node behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSection {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// First port tried for push sockets.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default)]
    pub require_reply_target: bool,
}

/// Bus and addressing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSection {
    /// `host:port` of the bus broker.
    #[serde(default = "default_bus_address")]
    pub bus_address: String,
    /// Channel namespace shared by nodes that should pair with each other.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// IP address to bind and advertise.  Absent: detect the outbound interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_gc_interval_ms() -> u64 {
    120_000
}
fn default_tick_interval_ms() -> u64 {
    3_000
}
fn default_base_port() -> u16 {
    8000
}
fn default_bus_address() -> String {
    "127.0.0.1:24900".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            base_port: default_base_port(),
            require_reply_target: false,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bus_address: default_bus_address(),
            prefix: None,
            interface: None,
        }
    }
}

impl AppConfig {
    /// Resolves this config into the options a node runs with.
    ///
    /// Intervals are floored (ping 1 s, GC 5 s, tick 1 s) and the host address
    /// is resolved through [`resolve_host`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidInterface`] if `network.interface` does not parse.
    pub fn to_node_options(&self) -> Result<NodeOptions, ConfigError> {
        let configured = match self.network.interface.as_deref() {
            Some(raw) => Some(
                raw.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidInterface(raw.to_string()))?,
            ),
            None => None,
        };
        let intervals = HeartbeatIntervals::floored(
            Duration::from_millis(self.node.heartbeat_interval_ms),
            Duration::from_millis(self.node.gc_interval_ms),
            Duration::from_millis(self.node.tick_interval_ms),
        );

        Ok(NodeOptions {
            heartbeat_interval: intervals.ping,
            gc_interval: intervals.gc,
            tick_interval: intervals.tick,
            host: resolve_host(configured),
            bus_address: self.network.bus_address.clone(),
            prefix: self.network.prefix.clone().filter(|p| !p.is_empty()),
            base_port: self.node.base_port,
            require_reply_target: self.node.require_reply_target,
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Path of the config file in the platform config directory.
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

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
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
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("peerlink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("peerlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("peerlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("peerlink_test_{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.node.log_level, "info");
        assert_eq!(cfg.node.heartbeat_interval_ms, 10_000);
        assert_eq!(cfg.node.gc_interval_ms, 120_000);
        assert_eq!(cfg.node.tick_interval_ms, 3_000);
        assert_eq!(cfg.node.base_port, 8000);
        assert!(!cfg.node.require_reply_target);
        assert_eq!(cfg.network.bus_address, "127.0.0.1:24900");
        assert_eq!(cfg.network.prefix, None);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_given_fields() {
        // Arrange
        let toml_str = r#"
[node]
gc_interval_ms = 5000

[network]
prefix = "orders"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.node.gc_interval_ms, 5000);
        assert_eq!(cfg.node.heartbeat_interval_ms, 10_000);
        assert_eq!(cfg.network.prefix.as_deref(), Some("orders"));
    }

    #[test]
    fn test_unset_optionals_are_omitted_from_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(!text.contains("prefix"));
        assert!(!text.contains("interface"));
    }

    #[test]
    fn test_to_node_options_floors_intervals() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.node.heartbeat_interval_ms = 10;
        cfg.node.gc_interval_ms = 100;
        cfg.node.tick_interval_ms = 0;
        cfg.network.interface = Some("127.0.0.1".to_string());

        // Act
        let options = cfg.to_node_options().unwrap();

        // Assert
        assert_eq!(options.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(options.gc_interval, Duration::from_secs(5));
        assert_eq!(options.tick_interval, Duration::from_secs(1));
        assert_eq!(options.host, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_to_node_options_maps_network_section() {
        let mut cfg = AppConfig::default();
        cfg.network.interface = Some(" 10.0.0.7 ".to_string());
        cfg.network.prefix = Some(String::new());
        cfg.network.bus_address = "10.0.0.1:7000".to_string();
        cfg.node.require_reply_target = true;

        let options = cfg.to_node_options().unwrap();

        assert_eq!(options.host, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(options.prefix, None, "an empty prefix means no prefix");
        assert_eq!(options.bus_address, "10.0.0.1:7000");
        assert!(options.require_reply_target);
    }

    #[test]
    fn test_to_node_options_rejects_bad_interface() {
        let mut cfg = AppConfig::default();
        cfg.network.interface = Some("eth0".to_string());
        assert!(matches!(
            cfg.to_node_options(),
            Err(ConfigError::InvalidInterface(_))
        ));
    }

    #[test]
    fn test_load_returns_default_when_file_absent() {
        let path = temp_dir().join("missing.toml");
        assert_eq!(load_config_from(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        // Arrange
        let dir = temp_dir();
        let path = dir.join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.node.base_port = 9100;
        cfg.network.prefix = Some("staging".to_string());

        // Act
        save_config_to(&path, &cfg).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_malformed_file_is_parse_error() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_default_config_path_ends_with_config_toml() {
        // A stripped environment without HOME may legitimately have no path.
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with("peerlink/config.toml"), "got {path:?}");
        }
    }
}
