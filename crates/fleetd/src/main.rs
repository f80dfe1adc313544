//! fleetd — the fleet control plane daemon.
//!
//! Single binary that assembles all fleet subsystems:
//! - Instance registry and launch templates (redb)
//! - Health checker
//! - Traffic router and reverse proxy adapter
//! - Metrics collector
//! - Scaling controller
//! - Admin API
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml
//! fleetd check-config --config fleet.toml
//! ```

mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use fleet_core::FleetConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to fleet.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

/// Used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,fleetd=debug,fleet_state=debug,fleet_health=debug,\
fleet_router=debug,fleet_metrics=debug,fleet_autoscale=debug,fleet_api=debug";

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            init_tracing(log_format);
            let fleet_config = FleetConfig::from_file(&config)?;
            info!(path = ?config, "configuration loaded");
            control_plane::run(fleet_config).await
        }
        Command::CheckConfig { config } => {
            let fleet_config = FleetConfig::from_file(&config)?;
            println!(
                "{}: ok ({} template(s), fleet size {}..={})",
                config.display(),
                fleet_config.templates.len(),
                fleet_config.fleet.min_size,
                fleet_config.fleet.max_size
            );
            Ok(())
        }
    }
}
