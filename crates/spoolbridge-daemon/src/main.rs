// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// spoolbridged: keeps the local print spooler's queue list in sync with
// printers discovered on the network.
//
// Entry point. Parses the command line, initialises logging, loads the
// configuration and hands over to the event loop.

mod cli;
mod daemon;
mod status;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spoolbridge_core::config::DaemonConfig;
use spoolbridge_print::{IppSpooler, MemorySpooler};

use cli::Args;
use daemon::Daemon;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level())),
        )
        .init();

    let mut config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    if args.print_config {
        return match config.to_json() {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "cannot serialize configuration");
                ExitCode::FAILURE
            }
        };
    }

    if config.has_nothing_to_do() {
        info!("no browse protocols and no BrowsePoll peers configured, nothing to do");
        return ExitCode::SUCCESS;
    }

    info!(version = env!("CARGO_PKG_VERSION"), dry_run = args.dry_run, "spoolbridged starting");

    let result = if args.dry_run {
        Daemon::new(config, MemorySpooler::new()).run().await
    } else {
        match IppSpooler::new(&config.spooler_uri) {
            Ok(spooler) => Daemon::new(config, spooler).run().await,
            Err(e) => Err(e),
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "spoolbridged failed");
            ExitCode::FAILURE
        }
    }
}
