//! Command line front end for Logic 2 automation.
//!
//! ```bash
//! # Application info and attached devices
//! logic2-automation info
//! logic2-automation devices --include-simulation
//!
//! # Run the capture described in a plan file and export it
//! logic2-automation capture plans/timed-8ch.toml --output out/
//!
//! # Serve the simulated backend on the default automation port
//! logic2-automation serve-sim
//! ```
//!
//! Connection, launch and logging settings come from `config/logic2.toml` (or
//! `--config`), overridden by `LOGIC2_*` environment variables.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use logic2_automation::config::{AutomationConfig, DEFAULT_CONFIG_PATH};
use logic2_automation::simulator::{self, SimulatorOptions};
use logic2_automation::{
    logging, CaptureConfiguration, CaptureMode, DeviceConfiguration, Manager,
    RawCsvExportOptions,
};

#[derive(Parser)]
#[command(name = "logic2-automation")]
#[command(about = "Drive Saleae Logic 2 through its automation API", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print application and API version
    Info,

    /// List attached devices
    Devices {
        /// Include the simulation devices
        #[arg(long)]
        include_simulation: bool,
    },

    /// Run a capture described by a TOML plan and export its raw data
    Capture {
        /// Capture plan
        plan: PathBuf,

        /// Output directory for the raw CSV export
        #[arg(long, short)]
        output: PathBuf,

        /// Also save the capture to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Serve the simulated backend
    ServeSim {
        /// Automation port; defaults to the configured port
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Capture plan file.
///
/// ```toml
/// device_id = "F4241"
/// manual_stop_after_seconds = 1.0
///
/// [device]
/// device = "logic"
/// enabled_digital_channels = [0, 1, 2, 3]
/// digital_sample_rate = 10000000
///
/// [capture]
/// [capture.capture_mode]
/// mode = "timed"
/// duration_seconds = 0.5
/// ```
#[derive(Debug, Deserialize)]
struct CapturePlan {
    #[serde(default)]
    device_id: Option<String>,
    device: DeviceConfiguration,
    #[serde(default)]
    capture: CaptureConfiguration,
    /// Stop a manual capture after this long
    #[serde(default)]
    manual_stop_after_seconds: Option<f64>,
}

impl CapturePlan {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading capture plan {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing capture plan {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AutomationConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Info => show_info(&config).await,
        Commands::Devices { include_simulation } => list_devices(&config, include_simulation).await,
        Commands::Capture { plan, output, save } => {
            run_capture(&config, &plan, &output, save.as_deref()).await
        }
        Commands::ServeSim { port } => serve_sim(port.unwrap_or(config.connection.port)).await,
    }
}

async fn show_info(config: &AutomationConfig) -> Result<()> {
    let manager = Manager::from_config(config).await?;
    let app = manager.get_app_info().await?;
    println!("Logic 2 {} (pid {})", app.app_version, app.app_pid);
    println!("Automation API {}", app.api_version);
    manager.close().await?;
    Ok(())
}

async fn list_devices(config: &AutomationConfig, include_simulation: bool) -> Result<()> {
    let manager = Manager::from_config(config).await?;
    let devices = manager.get_devices(include_simulation).await?;
    if devices.is_empty() {
        println!("No devices attached");
    }
    for device in &devices {
        let sim = if device.is_simulation { " (simulation)" } else { "" };
        println!("{:<10} {}{sim}", device.device_id, device.device_type);
    }
    manager.close().await?;
    Ok(())
}

async fn run_capture(
    config: &AutomationConfig,
    plan_path: &Path,
    output: &Path,
    save: Option<&Path>,
) -> Result<()> {
    let plan = CapturePlan::load(plan_path)?;
    let manual = matches!(plan.capture.capture_mode, CaptureMode::Manual(_));
    let manual_stop = match (manual, plan.manual_stop_after_seconds) {
        (true, Some(seconds)) if seconds > 0.0 => Some(Duration::from_secs_f64(seconds)),
        (true, _) => bail!("manual capture plans need a positive manual_stop_after_seconds"),
        (false, _) => None,
    };

    let manager = Manager::from_config(config).await?;
    let result = async {
        let mut capture = manager
            .start_capture(plan.device_id.as_deref(), &plan.device, &plan.capture)
            .await?;
        info!(capture_id = capture.id(), "Capture running");

        let finished = match manual_stop {
            Some(after) => {
                tokio::time::sleep(after).await;
                capture.stop().await
            }
            None => capture.wait().await,
        };
        if let Err(err) = finished {
            capture.close().await?;
            return Err(err.into());
        }

        capture
            .export_raw_data_csv(output, &RawCsvExportOptions::default())
            .await?;
        println!("Raw data written to {}", output.display());
        if let Some(path) = save {
            capture.save_capture(path).await?;
            println!("Capture saved to {}", path.display());
        }
        capture.close().await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    manager.close().await?;
    result
}

async fn serve_sim(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    println!("Simulated Logic 2 on {addr}; press Ctrl+C to stop");
    simulator::serve(SimulatorOptions::default(), addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_plan_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("plans/timed-8ch.toml");
        let plan = CapturePlan::load(&path).unwrap();
        assert_eq!(plan.device_id.as_deref(), Some("F4241"));
        assert!(matches!(plan.capture.capture_mode, CaptureMode::Timed(_)));
        let DeviceConfiguration::Logic(device) = plan.device;
        assert_eq!(device.enabled_digital_channels.len(), 8);
        assert_eq!(device.digital_sample_rate, Some(10_000_000));
    }
}
