//! Controller configuration using Figment.
//!
//! Configuration is layered:
//! 1. built-in defaults (every field has one)
//! 2. a TOML file, `config/lab_control.toml` unless another path is given
//! 3. environment variables prefixed with `LAB_CONTROL_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use lab_control::config::ControllerConfig;
//!
//! let config = ControllerConfig::load()?;
//! config.validate().map_err(lab_control::error::LabError::Configuration)?;
//! println!("Controller id: {}", config.application.controller_id);
//! # Ok::<(), lab_control::error::LabError>(())
//! ```
//!
//! Environment example: `LAB_CONTROL_EXECUTOR__TIMEOUT_MS=1000`.

use crate::device::SessionOptions;
use crate::error::{LabError, LabResult};
use crate::executor::ExecutorOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab_control.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LAB_CONTROL_";

/// Top-level controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument executor settings
    pub executor: ExecutorConfig,
    /// Router settings
    pub router: RouterConfig,
    /// Outbox settings
    pub outbox: OutboxConfig,
    /// Device session settings
    pub device: DeviceConfig,
    /// Instruments attached at start-up
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Target id that addresses the controller itself
    #[serde(default = "default_controller_id")]
    pub controller_id: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            controller_id: default_controller_id(),
            log_level: default_log_level(),
        }
    }
}

/// Instrument executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound for one suspending command in milliseconds
    #[serde(default = "default_command_timeout")]
    pub timeout_ms: u64,
    /// Report timed out commands to the outbox
    #[serde(default = "default_true")]
    pub report_timeouts: bool,
    /// Grace period per task when shutting down, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_command_timeout(),
            report_timeouts: true,
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// What the router does with envelopes addressed to an instrument it does not own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTargetPolicy {
    /// Discard silently (the target may be owned by another controller)
    #[default]
    Drop,
    /// Append an `Unknown instrument` record to the outbox
    Report,
}

/// Router configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Handling of envelopes addressed to instruments this controller does not own
    #[serde(default)]
    pub unknown_target_policy: UnknownTargetPolicy,
}

/// Outbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Maximum number of undelivered records
    #[serde(default = "default_outbox_capacity")]
    pub capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: default_outbox_capacity(),
        }
    }
}

/// Device session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Line ending expected on replies
    #[serde(default = "default_read_terminator")]
    pub read_terminator: String,
    /// Line ending appended to writes
    #[serde(default = "default_write_terminator")]
    pub write_terminator: String,
    /// Low level I/O timeout in milliseconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            read_terminator: default_read_terminator(),
            write_terminator: default_write_terminator(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

/// Instrument attached at start-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Resource locator, e.g. "ASRL2::INSTR"
    pub resource: String,
    /// Station the instrument belongs to
    pub station: String,
}

// Default value functions
fn default_name() -> String {
    "Lab Control".to_string()
}

fn default_controller_id() -> String {
    "controller".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_command_timeout() -> u64 {
    300_000
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_outbox_capacity() -> usize {
    1024
}

fn default_read_terminator() -> String {
    "\n".to_string()
}

fn default_write_terminator() -> String {
    "\r\n".to_string()
}

fn default_io_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl ControllerConfig {
    /// Load from the default file location and environment variables.
    pub fn load() -> LabResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> LabResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ControllerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Parse from a TOML string (no environment overlay).
    pub fn from_toml_str(raw: &str) -> LabResult<Self> {
        Ok(Figment::from(Serialized::defaults(ControllerConfig::default()))
            .merge(Toml::string(raw))
            .extract()?)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> LabResult<String> {
        toml::to_string_pretty(self).map_err(|e| LabError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.application.controller_id.trim().is_empty() {
            return Err("controller_id must not be empty".to_string());
        }

        if self.executor.timeout_ms == 0 {
            return Err("executor.timeout_ms must be greater than 0".to_string());
        }
        if self.executor.shutdown_timeout_ms == 0 {
            return Err("executor.shutdown_timeout_ms must be greater than 0".to_string());
        }
        if self.outbox.capacity == 0 {
            return Err("outbox.capacity must be greater than 0".to_string());
        }
        if self.device.read_terminator.is_empty() {
            return Err("device.read_terminator must not be empty".to_string());
        }

        // Each resource can be attached once at start-up
        let mut resources = HashSet::new();
        for instrument in &self.instruments {
            if instrument.resource.trim().is_empty() || instrument.station.trim().is_empty() {
                return Err(format!(
                    "Instrument definition needs a resource and a station: {:?}",
                    instrument
                ));
            }
            if !resources.insert(&instrument.resource) {
                return Err(format!("Duplicate instrument resource: {}", instrument.resource));
            }
        }

        Ok(())
    }

    /// Executor tuning from the `[executor]` section.
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            timeout: Duration::from_millis(self.executor.timeout_ms),
            report_timeouts: self.executor.report_timeouts,
        }
    }

    /// Session options from the `[device]` section.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_terminator: self.device.read_terminator.clone(),
            write_terminator: self.device.write_terminator.clone(),
            io_timeout: Duration::from_millis(self.device.io_timeout_ms),
        }
    }

    /// Grace period per task when the service stops.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.executor.shutdown_timeout_ms)
    }
}
