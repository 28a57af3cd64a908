//! Bridge configuration
//!
//! Stored as JSON. Every field has a default reproducing the production
//! kiosk, so an absent default file simply means "run with defaults".
//! Validation happens once at start-up; nothing here is mutated afterwards.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ms_error::{MedisenseError, Result};

use crate::constants::{acquisition, limits, paths, server, timing};
use crate::sensor::{default_sensor_specs, SensorCatalog, SensorKind, SensorSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,

    #[serde(default = "default_sensor_specs")]
    pub sensors: Vec<SensorSpec>,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// One serial device feeding the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,

    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,

    pub baud_rate: u32,

    /// Kind reported by this device. When absent, every frame must carry an
    /// `<alias>:<value>` prefix.
    #[serde(default)]
    pub kind: Option<SensorKind>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_busy_pause_ms")]
    pub busy_pause_ms: u64,
    #[serde(default = "default_idle_pause_ms")]
    pub idle_pause_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_simulation_period_ms")]
    pub simulation_period_ms: u64,
    #[serde(default = "default_simulation_validation_period_ms")]
    pub simulation_validation_period_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_status_every_heartbeats")]
    pub status_every_heartbeats: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Consecutive I/O failures before a channel is degraded
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Keep retrying channels that could not be opened at start-up
    #[serde(default)]
    pub retry_unavailable: bool,

    /// Skip the serial ports entirely and run the simulator
    #[serde(default)]
    pub force_simulation: bool,
}

fn default_true() -> bool {
    true
}
fn default_bind() -> String {
    server::BIND_ADDRESS.to_string()
}
fn default_max_connections() -> usize {
    server::MAX_CONNECTIONS
}
fn default_max_message_size() -> usize {
    ms_protocol::MAX_MESSAGE_SIZE
}
fn default_busy_pause_ms() -> u64 {
    timing::BUSY_PAUSE_MS
}
fn default_idle_pause_ms() -> u64 {
    timing::IDLE_PAUSE_MS
}
fn default_reconnect_backoff_ms() -> u64 {
    timing::RECONNECT_BACKOFF_MS
}
fn default_settle_ms() -> u64 {
    timing::SETTLE_MS
}
fn default_read_timeout_ms() -> u64 {
    timing::READ_TIMEOUT_MS
}
fn default_simulation_period_ms() -> u64 {
    timing::SIMULATION_PERIOD_MS
}
fn default_simulation_validation_period_ms() -> u64 {
    timing::SIMULATION_VALIDATION_PERIOD_MS
}
fn default_heartbeat_ms() -> u64 {
    timing::HEARTBEAT_MS
}
fn default_status_every_heartbeats() -> u64 {
    timing::STATUS_EVERY_HEARTBEATS
}
fn default_error_threshold() -> u32 {
    acquisition::ERROR_THRESHOLD
}

/// Serial wiring of the kiosk
fn default_channels() -> Vec<ChannelConfig> {
    let channel = |id: &str, port: &str, baud_rate: u32, kind: SensorKind, enabled: bool| ChannelConfig {
        id: id.to_string(),
        port: port.to_string(),
        baud_rate,
        kind: Some(kind),
        enabled,
    };
    vec![
        channel("temperature", "/dev/ttyUSB0", 9600, SensorKind::Temperature, true),
        channel("weight", "/dev/ttyUSB1", 57600, SensorKind::Weight, true),
        channel("validation", "/dev/ttyACM0", 9600, SensorKind::ValidationCode, true),
        channel("height", "/dev/ttyUSB2", 9600, SensorKind::Height, false),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            busy_pause_ms: default_busy_pause_ms(),
            idle_pause_ms: default_idle_pause_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            settle_ms: default_settle_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            simulation_period_ms: default_simulation_period_ms(),
            simulation_validation_period_ms: default_simulation_validation_period_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            status_every_heartbeats: default_status_every_heartbeats(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            retry_unavailable: false,
            force_simulation: false,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            channels: default_channels(),
            sensors: default_sensor_specs(),
            timing: TimingConfig::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

impl TimingConfig {
    pub fn busy_pause(&self) -> Duration {
        Duration::from_millis(self.busy_pause_ms)
    }
    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.idle_pause_ms)
    }
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn simulation_period(&self) -> Duration {
        Duration::from_millis(self.simulation_period_ms)
    }
    pub fn simulation_validation_period(&self) -> Duration {
        Duration::from_millis(self.simulation_validation_period_ms)
    }
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Pause after a poll pass; shorter when the pass produced data
    pub fn pass_pause(&self, produced: bool) -> Duration {
        if produced {
            self.busy_pause()
        } else {
            self.idle_pause()
        }
    }
}

impl BridgeConfig {
    /// Check cross-field constraints and build the sensor catalog
    pub fn validate(&self) -> Result<SensorCatalog> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| MedisenseError::invalid_config("server.bind", e.to_string()))?;
        if self.server.max_connections == 0 {
            return Err(MedisenseError::invalid_config("server.max_connections", "must be at least 1"));
        }
        if self.server.max_message_size < 16 {
            return Err(MedisenseError::invalid_config("server.max_message_size", "must be at least 16 bytes"));
        }

        let t = &self.timing;
        if t.busy_pause_ms >= t.idle_pause_ms {
            return Err(MedisenseError::invalid_config(
                "timing.idle_pause_ms",
                format!("must be greater than busy pause ({} ms)", t.busy_pause_ms),
            ));
        }
        for (field, value) in [
            ("timing.reconnect_backoff_ms", t.reconnect_backoff_ms),
            ("timing.read_timeout_ms", t.read_timeout_ms),
            ("timing.simulation_period_ms", t.simulation_period_ms),
            ("timing.heartbeat_ms", t.heartbeat_ms),
            ("timing.status_every_heartbeats", t.status_every_heartbeats),
        ] {
            if value == 0 {
                return Err(MedisenseError::invalid_config(field, "must be non-zero"));
            }
        }

        if self.acquisition.error_threshold == 0 {
            return Err(MedisenseError::invalid_config("acquisition.error_threshold", "must be at least 1"));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return Err(MedisenseError::invalid_config("channels.id", "channel id cannot be empty"));
            }
            if !ids.insert(channel.id.as_str()) {
                return Err(MedisenseError::invalid_config(
                    format!("channels.{}", channel.id),
                    "duplicate channel id",
                ));
            }
            if channel.port.trim().is_empty() {
                return Err(MedisenseError::invalid_config(
                    format!("channels.{}.port", channel.id),
                    "port cannot be empty",
                ));
            }
            if channel.baud_rate == 0 {
                return Err(MedisenseError::invalid_config(
                    format!("channels.{}.baud_rate", channel.id),
                    "must be non-zero",
                ));
            }
        }

        SensorCatalog::new(self.sensors.clone())
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

/// Where the configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Given on the command line or through the environment; must exist
    Explicit(PathBuf),
    /// The system default; optional
    Default(PathBuf),
}

/// Resolve the configuration path: CLI argument, then environment, then default
pub fn resolve_config_path(cli: Option<&Path>) -> ConfigSource {
    if let Some(path) = cli {
        return ConfigSource::Explicit(path.to_path_buf());
    }
    match std::env::var(paths::CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => ConfigSource::Explicit(PathBuf::from(path)),
        _ => ConfigSource::Default(PathBuf::from(paths::CONFIG_FILE)),
    }
}

/// Load the configuration described by `source`
pub fn load_config(source: &ConfigSource) -> Result<BridgeConfig> {
    match source {
        ConfigSource::Explicit(path) => load_config_file(path),
        ConfigSource::Default(path) => {
            if path.exists() {
                load_config_file(path)
            } else {
                info!("No configuration at {}, using built-in defaults", path.display());
                Ok(BridgeConfig::default())
            }
        }
    }
}

/// Read and parse one configuration file
pub fn load_config_file(path: &Path) -> Result<BridgeConfig> {
    let metadata = fs::metadata(path).map_err(|e| MedisenseError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    if metadata.len() > limits::MAX_CONFIG_FILE_SIZE {
        return Err(MedisenseError::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max_size: limits::MAX_CONFIG_FILE_SIZE,
        });
    }

    let content = fs::read_to_string(path).map_err(|e| MedisenseError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: BridgeConfig = serde_json::from_str(&content)?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
