//! keel CLI library

pub mod client;
pub mod commands;
pub mod error;
pub mod hooks;
pub mod prompt;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel_common::telemetry::LogFormat;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// keel - cluster restore and upgrade
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (text or json)
    #[arg(long, global = true, env = "KEEL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Runtime configuration file layered over the defaults
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore a cluster from a disaster-recovery backup
    Restore(commands::restore::RestoreArgs),
    /// Upgrade the cluster to a new Installation
    Upgrade(commands::upgrade::UpgradeArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        tokio::spawn(cancel_on_shutdown(cancel.clone()));

        let config = self.config.as_deref();
        match self.command {
            Commands::Restore(args) => commands::restore::run(args, config, cancel).await,
            Commands::Upgrade(args) => commands::upgrade::run(args, config, cancel).await,
        }
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn cancel_on_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "unable to watch for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    warn!("Shutdown requested, cancelling");
    token.cancel();
}
