//! Constants and configuration defaults for Medisense
//!
//! Every default used by the configuration layer lives here. The values
//! reproduce the production kiosk deployment; other deployments override
//! them in the configuration file.

/// Filesystem locations and environment variables
pub mod paths {
    /// Default configuration file
    pub const CONFIG_FILE: &str = "/etc/medisense/config.json";

    /// Environment variable overriding the configuration file path
    pub const CONFIG_ENV: &str = "MEDISENSE_CONFIG";

    /// Environment variable holding the log filter
    pub const LOG_ENV: &str = "MEDISENSE_LOG";
}

/// Network server defaults
pub mod server {
    pub const BIND_ADDRESS: &str = "127.0.0.1:8765";

    /// Maximum concurrent client sessions
    pub const MAX_CONNECTIONS: usize = 64;
}

/// Size limits
pub mod limits {
    /// Configuration files larger than this are refused
    pub const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

    /// A serial line longer than this without a newline is discarded
    pub const MAX_FRAME_SIZE: usize = 256;
}

/// Acquisition pacing and recovery (milliseconds unless noted)
pub mod timing {
    /// Pause after a poll pass that produced a frame
    pub const BUSY_PAUSE_MS: u64 = 50;

    /// Pause after a poll pass that produced nothing
    pub const IDLE_PAUSE_MS: u64 = 200;

    /// Fixed pause between reconnect attempts of a degraded channel
    pub const RECONNECT_BACKOFF_MS: u64 = 1000;

    /// Pause after opening ports so the devices can reset
    pub const SETTLE_MS: u64 = 2000;

    /// Serial read timeout once bytes are known to be waiting
    pub const READ_TIMEOUT_MS: u64 = 1000;

    pub const SIMULATION_PERIOD_MS: u64 = 2000;

    pub const SIMULATION_VALIDATION_PERIOD_MS: u64 = 30_000;

    pub const HEARTBEAT_MS: u64 = 10_000;

    /// Heartbeats between two aggregate status log lines
    pub const STATUS_EVERY_HEARTBEATS: u64 = 6;
}

/// Channel failure handling
pub mod acquisition {
    /// Consecutive I/O failures that move a channel to `Degraded`
    pub const ERROR_THRESHOLD: u32 = 5;
}

/// Sensor plausibility defaults
pub mod sensors {
    pub const WEIGHT_MIN_KG: f64 = 0.0;
    pub const WEIGHT_MAX_KG: f64 = 500.0;
    pub const WEIGHT_PRECISION: u32 = 1;

    pub const TEMPERATURE_MIN_C: f64 = 0.0;
    pub const TEMPERATURE_MAX_C: f64 = 50.0;
    pub const TEMPERATURE_PRECISION: u32 = 1;

    pub const HEIGHT_MIN_M: f64 = 0.3;
    pub const HEIGHT_MAX_M: f64 = 2.5;
    pub const HEIGHT_PRECISION: u32 = 2;

    /// Code carried by the reference validation card
    pub const VALIDATION_CODE: i64 = 310502;

    /// Largest decimal precision accepted in a sensor spec
    pub const MAX_PRECISION: u32 = 6;
}
