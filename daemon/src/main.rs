//! devdash daemon binary
//!
//! Loads the services file, supervises the services and keeps the
//! configuration in sync with the file until interrupted.

#![allow(unused_crate_dependencies)]

use clap::Parser;
use daemon::bootstrap::{bootstrap, BootstrapOptions};
use daemon::Daemon;
use devdash_core::{StartFlags, StartOptions};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "devdash")]
#[command(about = "Run and watch the services of a local development environment")]
#[command(version)]
struct Cli {
    /// Services file
    #[arg(long, value_name = "FILE", default_value = "services.toml")]
    config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Do not start services flagged with `start = true`
    #[arg(long, conflicts_with = "start_all")]
    no_auto_start: bool,

    /// Start every service not excluded from start-all
    #[arg(long)]
    start_all: bool,

    /// Start services in parallel instead of one at a time
    #[arg(long)]
    parallel: bool,

    /// Start services without waiting for their dependencies
    #[arg(long)]
    ignore_deps: bool,
}

impl Cli {
    fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            config_path: self.config.clone(),
            start: StartOptions {
                no_auto_start: self.no_auto_start,
                start_all: self.start_all,
            },
            flags: StartFlags {
                parallel: self.parallel,
                ignore_deps: self.ignore_deps,
            },
        }
    }
}

#[tokio::main]
async fn main() -> daemon::Result<()> {
    let cli = Cli::parse();
    devdash_core::utils::init_tracing(&cli.log_level)?;

    info!("Starting devdash {}", env!("CARGO_PKG_VERSION"));
    let handle = bootstrap(cli.bootstrap_options()).await?;
    let daemon = Daemon::new(handle);

    // Handle graceful shutdown
    let daemon_clone = daemon.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        daemon_clone.stop();
    });

    if let Err(e) = daemon.run().await {
        error!("Daemon failed: {}", e);
        return Err(e);
    }
    Ok(())
}
