//! keel CLI
//!
//! Restores an embedded cluster from a backup and upgrades it in place.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use keel_cli::Cli;
use keel_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    };
    if let Err(e) = init_telemetry(&telemetry) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_stopped() => {
            info!(reason = %e, "Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
