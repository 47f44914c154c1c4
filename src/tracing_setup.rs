//! Tracing initialisation.
//!
//! Structured logging for the controller using `tracing` and `tracing-subscriber`. Logs always
//! go to **stderr**: stdout belongs to the JSON-lines transport when the controller is served
//! over stdio.
//!
//! `RUST_LOG` wins over the configured level when it is set, e.g.
//! `RUST_LOG=lab_control::executor=trace,info`.
//!
//! # Example
//! ```no_run
//! use lab_control::{config::ControllerConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!(controller_id = %config.application.controller_id, "Controller starting");
//! # Ok(())
//! # }
//! ```

use crate::config::ControllerConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TracingConfig {
    /// Used when `RUST_LOG` is unset
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// Print `file:line` of each event
    pub with_source_location: bool,
    /// Print the module target of each event
    pub with_target: bool,
    /// ANSI colours; only honoured by the pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::default(),
            with_source_location: false,
            with_target: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Settings for the configured `application.log_level`.
    pub fn from_controller_config(config: &ControllerConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            ..Self::default()
        })
    }

    /// Set the line layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle `file:line` output.
    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.with_source_location = enabled;
        self
    }

    /// Toggle colours for the pretty format.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(self.with_target)
            .with_file(self.with_source_location)
            .with_line_number(self.with_source_location);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Install the global subscriber for the configured log level.
pub fn init_from_config(config: &ControllerConfig) -> Result<(), String> {
    init(TracingConfig::from_controller_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed (another component, or a test harness) is left in
/// place and this returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let installed = tracing_subscriber::registry()
        .with(config.layer().with_filter(config.filter()))
        .try_init();

    match installed {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => {
            tracing::debug!("Global subscriber already installed, keeping it");
            Ok(())
        }
        Err(e) => Err(format!("Failed to initialize tracing: {e}")),
    }
}

/// Parse a level name (`trace` through `error`, any case).
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    if level.chars().all(|c| c.is_ascii_alphabetic()) {
        if let Ok(parsed) = Level::from_str(level) {
            return Ok(parsed);
        }
    }
    Err(format!(
        "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_in_any_case() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert!(parse_log_level("chatty").is_err());
        assert!(parse_log_level("3").is_err());
        assert!(parse_log_level("").is_err());
    }

    #[test]
    fn controller_log_level_drives_the_subscriber() {
        let mut config = ControllerConfig::default();
        config.application.log_level = "debug".to_string();
        let tracing_config = TracingConfig::from_controller_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Compact);

        config.application.log_level = "loud".to_string();
        assert!(TracingConfig::from_controller_config(&config).is_err());
    }

    #[test]
    fn output_format_from_cli_value() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("pretty".parse::<OutputFormat>(), Ok(OutputFormat::Pretty));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn builder_overrides() {
        let config = TracingConfig::default()
            .with_format(OutputFormat::Json)
            .with_source_location(true)
            .with_ansi(false);

        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_source_location);
        assert!(!config.with_ansi);
        assert!(config.with_target);
    }
}
