//! Stand-in for the Logic 2 executable.
//!
//! Accepts the same automation flags as the real application, so
//! `Manager::launch` can start it in place of Logic 2:
//!
//! ```bash
//! logic2-sim --automation --automationPort 10430
//! ```
//!
//! Unknown trailing arguments are accepted and ignored.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, Level};

use logic2_automation::logging::{self, LogSettings};
use logic2_automation::simulator::{self, SimulatorOptions};
use logic2_automation::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "logic2-sim")]
#[command(about = "Simulated Logic 2 automation server", long_about = None)]
struct Args {
    /// Enable the automation server
    #[arg(long)]
    automation: bool,

    /// Automation server port
    #[arg(long = "automationPort", default_value_t = DEFAULT_PORT)]
    automation_port: u16,

    /// Further application arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(LogSettings::new(Level::INFO))?;

    if !args.automation {
        bail!("nothing to do without --automation");
    }
    if !args.extra.is_empty() {
        info!(extra = ?args.extra, "Ignoring extra arguments");
    }

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, args.automation_port));
    let options = SimulatorOptions::default();
    info!(pid = options.app_pid, %addr, "Starting simulated Logic 2");
    simulator::serve(options, addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}
