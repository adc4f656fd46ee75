//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/telemetry.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `TELEMETRY_`; `__` separates nesting
//!
//! Every section has defaults, so an empty file (or none at all) yields a working
//! configuration.
//!
//! # Example
//! ```no_run
//! use telemetry_ingest::config::TelemetryConfig;
//!
//! // TELEMETRY_SERIAL__BAUD_RATE=9600 overrides serial.baud_rate
//! let config = TelemetryConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppResult, TelemetryError};
use crate::framing::{FramingStrategy, DEFAULT_MAX_BUFFER_BYTES};
use crate::ingest::IngestOptions;
use crate::record::TimestampUnit;
use crate::transport::AdapterOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/telemetry.toml";

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Streaming byte connection
    pub serial: SerialConfig,
    /// Notification-channel peripheral
    pub notification: NotificationConfig,
    /// File replay
    pub replay: ReplayConfig,
    /// Frame decoder
    pub decoder: DecoderConfig,
    /// Record ordering
    pub ingest: IngestConfig,
    /// Session lifecycle
    pub pipeline: PipelineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Telemetry Monitor".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Default line speed
    pub baud_rate: u32,
    /// Buffer size for each read
    pub read_chunk_bytes: usize,
    /// Unit of the device timestamps
    pub timestamp_unit: TimestampUnit,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: crate::transport::serial::DEFAULT_BAUD_RATE,
            read_chunk_bytes: crate::transport::serial::DEFAULT_READ_CHUNK_BYTES,
            timestamp_unit: TimestampUnit::Milliseconds,
        }
    }
}

/// Notification-channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Scan duration in seconds
    pub scan_timeout_secs: u64,
    /// Wait after closing a session before a scan is reliable
    pub settle_delay_ms: u64,
    /// Link check period
    pub keep_alive_ms: u64,
    /// Advertised device name to highlight in scans
    pub device_name: String,
    /// Unit of the device timestamps
    pub timestamp_unit: TimestampUnit,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            settle_delay_ms: 500,
            keep_alive_ms: 100,
            device_name: crate::transport::notification::DEVICE_NAME.to_string(),
            timestamp_unit: TimestampUnit::Milliseconds,
        }
    }
}

/// File replay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Interval between records at speed 1.0
    pub base_interval_ms: u64,
    /// Default playback speed
    pub speed: f64,
    /// Unit of the file's timestamps
    pub timestamp_unit: TimestampUnit,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1000,
            speed: 1.0,
            timestamp_unit: TimestampUnit::Milliseconds,
        }
    }
}

/// Frame decoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Frame matching policy (brace, depth_aware)
    pub strategy: FramingStrategy,
    /// Cap on retained, not-yet-framed bytes
    pub max_buffer_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            strategy: FramingStrategy::Brace,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Ingest settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Drop out-of-order and duplicate records instead of delivering them.
    /// Off by default: a device reset restarts its clock mid-session.
    pub reject_out_of_order: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reject_out_of_order: false,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long a closing session may take before its worker is aborted
    pub shutdown_timeout_ms: u64,
    /// Reconnect after a mid-session loss
    pub auto_reconnect: bool,
    /// Attempts per loss when auto_reconnect is on
    pub max_reconnect_attempts: u32,
    /// Ceiling for the reconnect backoff
    pub reconnect_max_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 2000,
            auto_reconnect: false,
            max_reconnect_attempts: 5,
            reconnect_max_delay_ms: 5000,
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from `config/telemetry.toml` and environment variables
    ///
    /// Environment variables override the file, e.g.
    /// `TELEMETRY_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Defaults, then the file, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(TelemetryConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        self.check().map_err(TelemetryError::Configuration)
    }

    fn check(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err("serial.baud_rate must be greater than 0".to_string());
        }
        if self.serial.read_chunk_bytes == 0 {
            return Err("serial.read_chunk_bytes must be greater than 0".to_string());
        }

        if self.notification.scan_timeout_secs == 0 {
            return Err("notification.scan_timeout_secs must be greater than 0".to_string());
        }
        if self.notification.keep_alive_ms == 0 {
            return Err("notification.keep_alive_ms must be greater than 0".to_string());
        }

        if self.replay.base_interval_ms == 0 {
            return Err("replay.base_interval_ms must be greater than 0".to_string());
        }
        if !self.replay.speed.is_finite() || self.replay.speed <= 0.0 {
            return Err(format!(
                "Invalid replay.speed {}. Must be a positive number",
                self.replay.speed
            ));
        }

        // Must hold at least one complete wire object.
        if self.decoder.max_buffer_bytes < 256 {
            return Err(format!(
                "Invalid decoder.max_buffer_bytes {}. Must be at least 256",
                self.decoder.max_buffer_bytes
            ));
        }

        if self.pipeline.shutdown_timeout_ms == 0 {
            return Err("pipeline.shutdown_timeout_ms must be greater than 0".to_string());
        }
        if self.pipeline.auto_reconnect && self.pipeline.max_reconnect_attempts == 0 {
            return Err("pipeline.max_reconnect_attempts must be at least 1 when auto_reconnect is on".to_string());
        }

        Ok(())
    }

    fn ingest_options(&self, timestamp_unit: TimestampUnit) -> IngestOptions {
        IngestOptions {
            strategy: self.decoder.strategy,
            max_buffer_bytes: self.decoder.max_buffer_bytes,
            timestamp_unit,
            reject_out_of_order: self.ingest.reject_out_of_order,
        }
    }

    fn adapter_options(&self, timestamp_unit: TimestampUnit) -> AdapterOptions {
        AdapterOptions {
            ingest: self.ingest_options(timestamp_unit),
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    /// Adapter settings for serial sessions.
    pub fn serial_options(&self) -> AdapterOptions {
        self.adapter_options(self.serial.timestamp_unit)
    }

    /// Adapter settings for notification sessions.
    pub fn notification_options(&self) -> AdapterOptions {
        self.adapter_options(self.notification.timestamp_unit)
    }

    /// Adapter settings for replay sessions.
    pub fn replay_options(&self) -> AdapterOptions {
        self.adapter_options(self.replay.timestamp_unit)
    }

    /// Worker grace period on close.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.shutdown_timeout_ms)
    }
}
