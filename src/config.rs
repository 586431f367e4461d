//! Rig configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RIG_`, nested keys split on `__`
//!
//! Every section has defaults, so `RigConfig::default()` is valid without any
//! file; devices are always listed explicitly.
//!
//! # Example
//! ```no_run
//! use rig_control::config::RigConfig;
//!
//! let config = RigConfig::load_from("config/rig.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), rig_control::error::RigError>(())
//! ```

use crate::error::{AppResult, RigError};
use crate::model::{Device, DeviceKind};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Transmission pipeline pacing
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Remote-capture settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Communication speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Internal port read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Terminator appended to each outbound line
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
}

/// Pacing of the sender, listener and run controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Commands per write in steady-state sending
    #[serde(default = "default_sender_batch")]
    pub sender_batch_size: usize,
    /// Commands per write while homing or imaging
    #[serde(default = "default_run_batch")]
    pub run_batch_size: usize,
    /// Yield interval used by every worker loop
    #[serde(default = "default_yield_interval")]
    pub yield_interval_ms: u64,
    /// Bounded wait when draining the side-queue
    #[serde(default = "default_queue_wait")]
    pub queue_wait_ms: u64,
    /// Silence after which the listener re-issues a status query
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,
}

/// Remote-capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Directory downloaded images are written to
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Attempts at fetching a live-view frame that is not ready yet
    #[serde(default = "default_evf_attempts")]
    pub evf_retry_attempts: u32,
    /// Delay between live-view attempts in milliseconds
    #[serde(default = "default_evf_interval")]
    pub evf_retry_interval_ms: u64,
    /// Interval of the SDK event pump in milliseconds
    #[serde(default = "default_pump_interval")]
    pub event_pump_interval_ms: u64,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Address used in the `>{id}` wire prefix
    pub device_id: u32,
    /// Display name
    pub name: String,
    /// Device type
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Serial port the device is reached through
    #[serde(default)]
    pub port: Option<String>,
    /// Hardware identifier (USB serial number, camera body id)
    #[serde(default)]
    pub hardware_id: Option<String>,
    /// Firmware / software identifier
    #[serde(default)]
    pub software_id: Option<String>,
}

// Default value functions
fn default_name() -> String {
    "Rig Control".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout() -> u64 {
    50
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

fn default_sender_batch() -> usize {
    1
}

fn default_run_batch() -> usize {
    2
}

fn default_yield_interval() -> u64 {
    10
}

fn default_queue_wait() -> u64 {
    50
}

fn default_stale_after() -> u64 {
    500
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("captures")
}

fn default_evf_attempts() -> u32 {
    50
}

fn default_evf_interval() -> u64 {
    100
}

fn default_pump_interval() -> u64 {
    20
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            line_terminator: default_line_terminator(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sender_batch_size: default_sender_batch(),
            run_batch_size: default_run_batch(),
            yield_interval_ms: default_yield_interval(),
            queue_wait_ms: default_queue_wait(),
            stale_after_ms: default_stale_after(),
        }
    }
}

impl PipelineConfig {
    /// Worker yield interval
    pub fn yield_interval(&self) -> Duration {
        Duration::from_millis(self.yield_interval_ms)
    }

    /// Bounded side-queue wait
    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    /// Staleness window
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            evf_retry_attempts: default_evf_attempts(),
            evf_retry_interval_ms: default_evf_interval(),
            event_pump_interval_ms: default_pump_interval(),
        }
    }
}

impl DeviceDefinition {
    /// Build the runtime device record for this definition.
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(self.device_id, self.name.clone(), self.kind);
        device.port = self.port.clone();
        device.hardware_id = self.hardware_id.clone();
        device.software_id = self.software_id.clone();
        device
    }
}

impl RigConfig {
    /// Load configuration from a specific file path, with `RIG_` environment overrides.
    ///
    /// Example override: `RIG_PIPELINE__RUN_BATCH_SIZE=4`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RIG_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string.
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::string(source))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.pipeline.sender_batch_size == 0 || self.pipeline.run_batch_size == 0 {
            return Err(RigError::Configuration(
                "Batch sizes must be at least 1".to_string(),
            ));
        }

        if self.pipeline.yield_interval_ms == 0 {
            return Err(RigError::Configuration(
                "yield_interval_ms must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.device_id) {
                return Err(RigError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.device_id
                )));
            }
            if device.kind == DeviceKind::RemoteCapture && device.port.is_some() {
                return Err(RigError::Configuration(format!(
                    "Remote-capture device '{}' cannot be bound to a serial port",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RigError::Configuration(format!("Failed to serialize configuration: {e}")))
    }

    /// Runtime device records for every configured device.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(DeviceDefinition::to_device).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "Test Rig"
        log_level = "debug"

        [pipeline]
        run_batch_size = 4

        [[devices]]
        device_id = 0
        name = "turntable"
        type = "positioner"
        port = "/dev/ttyUSB0"

        [[devices]]
        device_id = 3
        name = "body"
        type = "remote_capture"
        hardware_id = "CANON-1234"
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = RigConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "Test Rig");
        assert_eq!(config.pipeline.run_batch_size, 4);
        assert_eq!(config.pipeline.sender_batch_size, 1);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].kind, DeviceKind::RemoteCapture);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = RigConfig::from_toml_str(SAMPLE).unwrap();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = RigConfig::from_toml_str(SAMPLE).unwrap();
        config.pipeline.run_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::from_toml_str(SAMPLE).unwrap();
        config.devices[1].device_id = 0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::from_toml_str(SAMPLE).unwrap();
        config.devices[1].port = Some("COM4".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = RigConfig::load_from(&path).unwrap();
        assert_eq!(config.devices()[0].port.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_effective_config_reloads() {
        let config = RigConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[[devices]]"));

        let reloaded = RigConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reloaded.pipeline.run_batch_size, 4);
        assert_eq!(reloaded.devices[1].hardware_id.as_deref(), Some("CANON-1234"));
        assert!(reloaded.validate().is_ok());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(RigConfig::default().validate().is_ok());
    }
}
