//! CLI entry point for lab-control
//!
//! Runs a controller over stdin/stdout: one JSON envelope per input line, one JSON record
//! per output line. Logs go to stderr.
//!
//! # Usage
//!
//! Serve with two simulated instruments:
//! ```bash
//! lab-control serve --sim ASRL2::INSTR=PowerSupply-4321 --sim ASRL3::INSTR=VNA-1234
//! ```
//!
//! Check a configuration file:
//! ```bash
//! lab-control check-config --config config/lab_control.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lab_control::config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use lab_control::device::sim::SimResourceManager;
use lab_control::driver::DriverRegistry;
use lab_control::service::ControllerService;
use lab_control::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "lab-control")]
#[command(about = "Command routing controller for lab instruments", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller over stdin/stdout JSON lines
    Serve {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Simulated device, as LOCATOR=IDENTITY (repeatable)
        #[arg(long = "sim", value_name = "LOCATOR=IDENTITY")]
        sims: Vec<String>,

        /// Keep serving this long after input closes, so queued commands can finish
        #[arg(long, default_value = "1000")]
        linger_ms: u64,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            sims,
            linger_ms,
        } => serve(config, sims, Duration::from_millis(linger_ms), cli.log_format).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: &Path) -> Result<ControllerConfig> {
    let config = ControllerConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

async fn serve(
    config_path: PathBuf,
    sims: Vec<String>,
    linger: Duration,
    log_format: OutputFormat,
) -> Result<()> {
    let config = load_config(&config_path)?;

    let tracing_config = TracingConfig::from_controller_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(log_format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    let resources = SimResourceManager::from_specs(&sims).context("parsing --sim devices")?;
    tracing::info!(devices = sims.len(), "Simulated resource manager ready");

    let sink = lab_control::transport::LineSink::new(tokio::io::stdout());
    let mut service =
        ControllerService::start(config, Arc::new(resources), DriverRegistry::builtin(), sink)
            .await?;
    service.spawn_reader(BufReader::new(tokio::io::stdin()));

    tokio::select! {
        forwarded = service.wait_for_readers() => {
            let forwarded = forwarded?;
            tracing::info!(forwarded, "Input closed");
            tokio::time::sleep(linger).await;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted");
        }
    }

    service.shutdown().await?;
    Ok(())
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    print!("{}", config.to_toml()?);
    eprintln!("{} is valid", config_path.display());
    Ok(())
}
