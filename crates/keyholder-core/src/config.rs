//! Application configuration management.
//!
//! Both binaries read the same layered configuration:
//! 1. Built-in defaults ([`Config::default`])
//! 2. An optional TOML file (`KEYHOLDER_CONFIG`, or the platform default path)
//! 3. Environment overrides such as `KEYHOLDER__HEALTH__INTERVAL_SECS=10`
//!
//! Sections: `server`, `discovery`, `health`, `forwarder`, `session`, `device`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionLimits;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "KEYHOLDER_CONFIG";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "KEYHOLDER";

/// mDNS service type announced by devices that are provisioned and ready.
pub const SERVICE_TYPE: &str = "_keyholder._tcp.local.";

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").unwrap_or_else(|e| unreachable!("{e}"))
});

/// Whether `mac` looks like `AA:BB:CC:DD:EE:FF`.
#[must_use]
pub fn is_valid_mac_address(mac: &str) -> bool {
    MAC_ADDRESS.is_match(mac)
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration sources could not be merged or deserialized.
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    /// The configuration could not be written.
    #[error("failed to save configuration: {0}")]
    SaveError(String),

    /// A single field failed validation.
    #[error("invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} configuration fields are invalid", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Control-surface HTTP server.
    pub server: ServerConfig,
    /// mDNS and BLE listeners.
    pub discovery: DiscoveryConfig,
    /// Health monitor and staleness pruner.
    pub health: HealthConfig,
    /// Command forwarder.
    pub forwarder: ForwarderConfig,
    /// Session limits enforced by the device.
    pub session: SessionLimits,
    /// Reference device runtime.
    pub device: DeviceConfig,
}

/// Control-surface server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,
    /// Use production logging (JSON files plus compact stdout).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

/// Discovery listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// mDNS service type to browse.
    pub service_type: String,
    /// Interval between radar sweeps (browse restarts).
    pub sweep_interval_secs: u64,
    /// Run the mDNS listener.
    pub mdns_enabled: bool,
    /// Run the BLE scanner.
    pub ble_enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            sweep_interval_secs: 30,
            mdns_enabled: true,
            ble_enabled: true,
        }
    }
}

impl DiscoveryConfig {
    /// Radar sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Health monitor and pruner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe round cadence.
    pub interval_secs: u64,
    /// Per-probe timeout.
    pub probe_timeout_ms: u64,
    /// Consecutive failures that evict an entry.
    pub failure_threshold: u32,
    /// Pruner cadence.
    pub prune_interval_secs: u64,
    /// Entries unseen for longer than this are pruned.
    pub stale_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            prune_interval_secs: 30,
            stale_after_secs: 120,
        }
    }
}

impl HealthConfig {
    /// Probe round cadence.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Pruner cadence.
    #[must_use]
    pub const fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    /// Staleness window.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Command forwarder settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Timeout for a forwarded request.
    pub request_timeout_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
        }
    }
}

impl ForwarderConfig {
    /// Timeout for a forwarded request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Reference device settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Listen address for the device-facing API.
    pub bind: String,
    /// Human readable device name, announced over mDNS.
    pub name: String,
    /// MAC address announced in the mDNS TXT record.
    pub mac: Option<String>,
    /// Directory for persisted stats and reward history.
    pub data_dir: Option<PathBuf>,
    /// Register the device on mDNS.
    pub announce: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            name: "Keyholder".to_string(),
            mac: None,
            data_dir: None,
            announce: true,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// When `path` is `None`, `KEYHOLDER_CONFIG` is consulted, then the
    /// platform default location; a missing default file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, a source cannot be
    /// parsed, or the merged result fails validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        match explicit {
            Some(file) => {
                if !file.exists() {
                    return Err(ConfigError::NotFound(file));
                }
                builder = builder.add_source(
                    config::File::from(file.as_path()).format(config::FileFormat::Toml),
                );
            }
            None => {
                if let Some(default) = default_config_path() {
                    builder = builder.add_source(
                        config::File::from(default.as_path())
                            .format(config::FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        let merged = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = merged.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let merged = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;
        let config: Self = merged.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SaveError`] if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SaveError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::SaveError(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::SaveError(e.to_string()))
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns every violation found, wrapped in
    /// [`ConfigError::MultipleValidationErrors`] when there is more than one.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut fail = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if self.server.bind.parse::<SocketAddr>().is_err() {
            fail("server.bind", "must be a socket address such as 0.0.0.0:3000");
        }
        if self.device.bind.parse::<SocketAddr>().is_err() {
            fail("device.bind", "must be a socket address such as 0.0.0.0:8080");
        }
        if let Some(mac) = &self.device.mac {
            if !is_valid_mac_address(mac) {
                fail("device.mac", "must look like AA:BB:CC:DD:EE:FF");
            }
        }
        if self.discovery.sweep_interval_secs == 0 {
            fail("discovery.sweep_interval_secs", "must be greater than zero");
        }
        if !self.discovery.service_type.ends_with(".local.") {
            fail("discovery.service_type", "must end with '.local.'");
        }
        if self.health.interval_secs == 0 {
            fail("health.interval_secs", "must be greater than zero");
        }
        if self.health.probe_timeout_ms == 0
            || self.health.probe_timeout_ms >= self.health.interval_secs.saturating_mul(1_000)
        {
            fail(
                "health.probe_timeout_ms",
                "must be non-zero and shorter than the probe interval",
            );
        }
        if self.health.failure_threshold == 0 {
            fail("health.failure_threshold", "must be at least 1");
        }
        if self.health.stale_after_secs <= self.health.interval_secs {
            fail(
                "health.stale_after_secs",
                "must be longer than the probe interval",
            );
        }
        if self.forwarder.request_timeout_ms == 0 {
            fail("forwarder.request_timeout_ms", "must be greater than zero");
        }
        if let Err(message) = self.session.check() {
            fail("session", &message);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Default configuration file location.
///
/// On the Raspberry Pi style deployment: `/etc/keyholder/config.toml`.
/// Elsewhere: the platform config dir, e.g. `~/.config/keyholder/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/keyholder/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "keyholder")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
