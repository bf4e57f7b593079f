//! TOML-based configuration persistence for the sharing session.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\ArPet\config.toml`
//! - Linux:    `~/.config/arpet/config.toml`
//! - macOS:    `~/Library/Application Support/ArPet/config.toml`
//!
//! A different file can be named explicitly (the `--config` flag); that file
//! must exist.
//!
//! # Example file
//!
//! ```toml
//! log_level = "debug"
//!
//! [session]
//! debug_timings = true
//! max_pairing_attempts = 5
//! world_center = [0.0, 0.0, -1.0]
//!
//! [network]
//! transport = "tcp"
//! device_name = "kitchen-tablet"
//! control_port = 24900
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file.  This allows
//! the app to work correctly on first run (before a config file exists) and
//! when upgrading from an older config file that is missing newer fields.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arpet_core::Pose;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::message_service::DEFAULT_REPLY_TIMEOUT;
use crate::application::session::{
    SessionSettings, SessionTimings, DEBUG_HOST_VISIBILITY, DEFAULT_GUEST_TIMEOUT,
    DEFAULT_HOST_VISIBILITY, DEFAULT_MAX_PAIRING_ATTEMPTS, DEFAULT_SCREEN_TRANSITION,
};
use crate::infrastructure::network::tcp::{
    TcpTransportConfig, DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_DISCOVERY_WINDOW,
};

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

    /// An address field does not hold an IP address.
    #[error("network.{field} = {value:?} is not an IP address")]
    InvalidAddress { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Timing and pairing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Shortens the host visibility window to the debug value.
    #[serde(default)]
    pub debug_timings: bool,
    #[serde(default = "default_host_visibility_secs")]
    pub host_visibility_secs: u64,
    #[serde(default = "default_guest_timeout_secs")]
    pub guest_timeout_secs: u64,
    #[serde(default = "default_screen_transition_secs")]
    pub screen_transition_secs: u64,
    #[serde(default = "default_max_pairing_attempts")]
    pub max_pairing_attempts: u32,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    /// Translation `[x, y, z]` of the pet anchor in this device's frame.
    #[serde(default)]
    pub world_center: [f32; 3],
}

/// Which link technology to use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Tcp,
    WifiDirect,
}

/// Link settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Name other devices see.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
}

// ── Serde default helpers ─────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_host_visibility_secs() -> u64 {
    DEFAULT_HOST_VISIBILITY.as_secs()
}
fn default_guest_timeout_secs() -> u64 {
    DEFAULT_GUEST_TIMEOUT.as_secs()
}
fn default_screen_transition_secs() -> u64 {
    DEFAULT_SCREEN_TRANSITION.as_secs()
}
fn default_max_pairing_attempts() -> u32 {
    DEFAULT_MAX_PAIRING_ATTEMPTS
}
fn default_reply_timeout_secs() -> u64 {
    DEFAULT_REPLY_TIMEOUT.as_secs()
}
fn default_device_name() -> String {
    "arpet".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_discovery_window_ms() -> u64 {
    DEFAULT_DISCOVERY_WINDOW.as_millis() as u64
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session: SessionConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debug_timings: false,
            host_visibility_secs: default_host_visibility_secs(),
            guest_timeout_secs: default_guest_timeout_secs(),
            screen_transition_secs: default_screen_transition_secs(),
            max_pairing_attempts: default_max_pairing_attempts(),
            reply_timeout_secs: default_reply_timeout_secs(),
            world_center: [0.0; 3],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            device_name: default_device_name(),
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            discovery_port: default_discovery_port(),
            broadcast_address: default_broadcast_address(),
            discovery_window_ms: default_discovery_window_ms(),
        }
    }
}

// ── Mapping onto runtime settings ─────────────────────────────────────────────

impl SessionConfig {
    /// Timers for the session.  `debug_timings` wins over
    /// `host_visibility_secs`.
    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            host_visibility: if self.debug_timings {
                DEBUG_HOST_VISIBILITY
            } else {
                Duration::from_secs(self.host_visibility_secs)
            },
            guest_timeout: Duration::from_secs(self.guest_timeout_secs),
            screen_transition: Duration::from_secs(self.screen_transition_secs),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Builds the session settings with the pet anchor at `world_center`.
    pub fn settings(&self) -> SessionSettings {
        let [x, y, z] = self.world_center;
        SessionSettings::new(Pose::from_translation(x, y, z))
            .with_timings(self.timings())
            .with_max_pairing_attempts(self.max_pairing_attempts)
    }
}

impl NetworkConfig {
    /// Settings for the TCP transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if an address does not parse.
    pub fn tcp_config(&self) -> Result<TcpTransportConfig, ConfigError> {
        Ok(TcpTransportConfig {
            device_name: self.device_name.clone(),
            bind_address: parse_ip("bind_address", &self.bind_address)?,
            control_port: self.control_port,
            discovery_port: self.discovery_port,
            broadcast_address: parse_ip("broadcast_address", &self.broadcast_address)?,
            discovery_window: Duration::from_millis(self.discovery_window_ms),
        })
    }
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

// ── File I/O ──────────────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file, returning
/// `AppConfig::default()` if the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    read_config(&config_file_path()?, true)
}

/// Loads `AppConfig` from an explicitly named file.
///
/// # Errors
///
/// Unlike [`load_config`], a missing file is an error.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    read_config(path, false)
}

fn read_config(path: &Path, missing_ok: bool) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if missing_ok && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(AppConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Same as [`save_config`].
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
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

/// Resolves the platform config base directory plus the `ArPet` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ArPet"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("arpet"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ArPet")
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
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("arpet_test_{}", Uuid::new_v4()))
            .join("config.toml")
    }

    // ── AppConfig defaults ────────────────────────────────────────────────────

    #[test]
    fn test_app_config_default_has_expected_ports() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.network.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(cfg.network.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(cfg.network.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_app_config_default_log_level_is_info() {
        assert_eq!(AppConfig::default().log_level, "info");
    }

    #[test]
    fn test_default_session_config_matches_session_defaults() {
        let cfg = SessionConfig::default();

        assert_eq!(cfg.timings(), SessionTimings::default());
        assert_eq!(cfg.reply_timeout(), DEFAULT_REPLY_TIMEOUT);
        assert_eq!(cfg.settings().max_pairing_attempts, DEFAULT_MAX_PAIRING_ATTEMPTS);
    }

    // ── Mapping ───────────────────────────────────────────────────────────────

    #[test]
    fn test_debug_timings_override_host_visibility() {
        // Arrange
        let cfg = SessionConfig {
            debug_timings: true,
            host_visibility_secs: 999,
            ..SessionConfig::default()
        };

        // Act
        let timings = cfg.timings();

        // Assert
        assert_eq!(timings.host_visibility, DEBUG_HOST_VISIBILITY);
        assert_eq!(timings.guest_timeout, DEFAULT_GUEST_TIMEOUT);
    }

    #[test]
    fn test_world_center_becomes_pet_anchor_translation() {
        let cfg = SessionConfig {
            world_center: [1.0, 2.0, -3.0],
            ..SessionConfig::default()
        };

        let settings = cfg.settings();

        assert_eq!(settings.world_center().translation(), (1.0, 2.0, -3.0));
    }

    #[test]
    fn test_network_config_maps_to_tcp_config() {
        // Arrange
        let cfg = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            discovery_window_ms: 750,
            ..NetworkConfig::default()
        };

        // Act
        let tcp = cfg.tcp_config().unwrap();

        // Assert
        assert_eq!(tcp.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(tcp.broadcast_address, IpAddr::V4(Ipv4Addr::BROADCAST));
        assert_eq!(tcp.discovery_window, Duration::from_millis(750));
        assert_eq!(tcp.device_name, "arpet");
    }

    #[test]
    fn test_bad_bind_address_is_reported_with_field_name() {
        let cfg = NetworkConfig {
            bind_address: "not-an-ip".to_string(),
            ..NetworkConfig::default()
        };

        let err = cfg.tcp_config().unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidAddress { field: "bind_address", .. }
        ));
    }

    // ── TOML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn test_app_config_serializes_and_deserializes_round_trip() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.network.control_port = 9000;
        cfg.network.transport = TransportKind::WifiDirect;
        cfg.session.world_center = [0.5, 0.0, -2.0];

        // Act
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AppConfig = toml::from_str(&toml_str).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
        assert!(toml_str.contains("transport = \"wifi-direct\""));
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_deserialize_partial_session_overrides_defaults() {
        // Arrange
        let toml_str = r#"
log_level = "debug"

[session]
max_pairing_attempts = 5
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.session.max_pairing_attempts, 5);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.session.guest_timeout_secs, DEFAULT_GUEST_TIMEOUT.as_secs());
        assert_eq!(cfg.network, NetworkConfig::default());
    }

    #[test]
    fn test_unknown_transport_is_a_parse_error() {
        let result: Result<AppConfig, toml::de::Error> =
            toml::from_str("[network]\ntransport = \"carrier-pigeon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let result: Result<AppConfig, toml::de::Error> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    // ── File I/O ──────────────────────────────────────────────────────────────

    #[test]
    fn test_save_and_load_config_round_trip_via_temp_dir() {
        // Arrange
        let path = temp_config_path();
        let mut cfg = AppConfig::default();
        cfg.network.control_port = 12345;
        cfg.log_level = "trace".to_string();

        // Act
        save_config_to(&cfg, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let result = load_config_from(&temp_config_path());
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_platform_missing_file_falls_back_to_default() {
        let result = read_config(&temp_config_path(), true);
        assert_eq!(result.unwrap(), AppConfig::default());
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("config.toml"),
                "config file must be named config.toml, got {path:?}"
            );
        }
        // NoPlatformConfigDir (e.g. a stripped CI env) is also acceptable.
    }
}
