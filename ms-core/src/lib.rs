//! Medisense Core Library
//!
//! Domain model of the sensor aggregation bridge.
//!
//! # Module Structure
//!
//! - `sensor` - Sensor kinds, acceptance rules, alias catalog
//! - `validation` - Raw frame text to accepted reading
//! - `registry` - Shared store of latest readings
//! - `config` - JSON configuration, defaults and validation
//! - `constants` - Defaults and limits
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Instant;
//! use ms_core::{SensorCatalog, SensorKind, SensorRegistry};
//!
//! let registry = SensorRegistry::new(Arc::new(SensorCatalog::builtin().unwrap()));
//! registry.accept(SensorKind::Weight, "70.4", Instant::now()).unwrap();
//! assert_eq!(registry.measure_all().weight, Some(70.4));
//! ```

pub mod config;
pub mod constants;
pub mod registry;
pub mod sensor;
pub mod validation;

pub use config::{
    load_config, load_config_file, resolve_config_path, AcquisitionConfig, BridgeConfig,
    ChannelConfig, ConfigSource, ServerConfig, TimingConfig,
};
pub use registry::{SensorRegistry, SensorSlot};
pub use sensor::{default_sensor_specs, Acceptance, Reading, SensorCatalog, SensorKind, SensorSpec};
pub use validation::{round_to_precision, validate, Rejection};

pub use ms_error::{MedisenseError, Result};
