//! Configuration System using Figment
//!
//! Strongly-typed configuration for the scheduler, storage destination, logging and
//! the simulated camera. Configuration is layered:
//! 1. Built-in defaults ([`AcqConfig::default`] is always valid)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `RUST_MDA_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use rust_mda::config::AcqConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // RUST_MDA_SCHEDULER__MAX_BUFFER_POLLS=500 overrides the file
//! let config = AcqConfig::load_from("config/acquisition.toml")?;
//! config.validate()?;
//! println!("poll budget: {}", config.scheduler.max_buffer_polls);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AcqError, AcqResult};
use crate::experiment::run_engine::SchedulerSettings;
use crate::hardware::mock::MockCamera;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUST_MDA_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcqConfig {
    /// Logging and application identity
    pub application: ApplicationConfig,
    /// Scheduler tunables
    pub scheduler: SchedulerConfig,
    /// Dataset destination
    pub storage: StorageConfig,
    /// Simulated camera
    pub camera: CameraConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Scheduler tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Empty buffer polls allowed per step in continuous mode
    pub max_buffer_polls: u32,
    /// Wait bound per poll, e.g. "1ms"
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Continuous mode warns when free < total / divisor
    pub low_buffer_divisor: u64,
    /// Stepwise mode warns when free < channels * reserve
    pub per_channel_reserve: u64,
    /// Per-subscriber capacity of the event broadcast
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_buffer_polls: 300,
            poll_interval: Duration::from_millis(1),
            low_buffer_divisor: 10,
            per_channel_reserve: 10,
            event_capacity: 1024,
        }
    }
}

/// Dataset destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory the dataset is created in
    pub location: String,
    /// Dataset name
    pub dataset_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: "./data".to_string(),
            dataset_name: "acquisition".to_string(),
        }
    }
}

/// Simulated camera used by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per pixel (1 or 2)
    pub bytes_per_pixel: u32,
    /// Circular buffer capacity in frames
    pub buffer_capacity: u64,
    /// Readout time of one snapped frame
    #[serde(with = "humantime_serde")]
    pub frame_interval: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            bytes_per_pixel: 2,
            buffer_capacity: 1000,
            frame_interval: Duration::from_millis(10),
        }
    }
}

impl AcqConfig {
    /// Defaults merged with `RUST_MDA_` environment variables.
    pub fn load() -> AcqResult<Self> {
        Ok(Self::figment(None).extract()?)
    }

    /// Defaults, then the TOML file at `path`, then environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AcqError::Configuration(format!(
                "config file {} not found",
                path.display()
            )));
        }
        Ok(Self::figment(Some(path)).extract()?)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AcqConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AcqResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }
        let format = self.application.log_format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            )));
        }

        let s = &self.scheduler;
        if s.max_buffer_polls == 0 {
            return Err(AcqError::Configuration(
                "scheduler.max_buffer_polls must be at least 1".into(),
            ));
        }
        if s.poll_interval.is_zero() {
            return Err(AcqError::Configuration(
                "scheduler.poll_interval must be positive".into(),
            ));
        }
        if s.low_buffer_divisor == 0 {
            return Err(AcqError::Configuration(
                "scheduler.low_buffer_divisor must be at least 1".into(),
            ));
        }
        if s.event_capacity == 0 {
            return Err(AcqError::Configuration(
                "scheduler.event_capacity must be at least 1".into(),
            ));
        }

        if self.storage.dataset_name.trim().is_empty() {
            return Err(AcqError::Configuration(
                "storage.dataset_name must not be empty".into(),
            ));
        }

        let c = &self.camera;
        if c.width == 0 || c.height == 0 {
            return Err(AcqError::Configuration(format!(
                "camera size {}x{} must be non-zero",
                c.width, c.height
            )));
        }
        if c.buffer_capacity == 0 {
            return Err(AcqError::Configuration(
                "camera.buffer_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Scheduler settings derived from the `scheduler` and `storage` sections.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_buffer_polls: self.scheduler.max_buffer_polls,
            poll_interval: self.scheduler.poll_interval,
            low_buffer_divisor: self.scheduler.low_buffer_divisor,
            per_channel_reserve: self.scheduler.per_channel_reserve,
            location: self.storage.location.clone(),
            dataset_name: self.storage.dataset_name.clone(),
        }
    }

    /// Build the simulated camera described by the `camera` section.
    pub fn mock_camera(&self) -> MockCamera {
        MockCamera::builder()
            .size(self.camera.width, self.camera.height)
            .bytes_per_pixel(self.camera.bytes_per_pixel)
            .buffer_capacity(self.camera.buffer_capacity)
            .readout(self.camera.frame_interval)
            .build()
    }
}
