// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line interface. Values given here override the configuration file.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use spoolbridge_core::config::{AutoShutdownMode, DaemonConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AutoShutdownArg {
    /// Exit once no remote printers are left
    On,
    /// Keep running
    Off,
    /// Auto-shutdown only while the mDNS browser is unavailable
    Avahi,
}

impl From<AutoShutdownArg> for AutoShutdownMode {
    fn from(arg: AutoShutdownArg) -> Self {
        match arg {
            AutoShutdownArg::On => Self::On,
            AutoShutdownArg::Off => Self::Off,
            AutoShutdownArg::Avahi => Self::FollowBrowser,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "spoolbridged")]
#[command(about = "Bridge network printers into the local print spooler", long_about = None)]
pub struct Args {
    /// Configuration file (directive format, or JSON with a .json extension)
    #[arg(short, long, default_value = "/etc/spoolbridge/spoolbridged.conf")]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub debug: bool,

    /// Auto-shutdown mode
    #[arg(long, value_enum)]
    pub autoshutdown: Option<AutoShutdownArg>,

    /// Seconds without remote printers before auto-shutdown
    #[arg(long)]
    pub autoshutdown_timeout: Option<u64>,

    /// Use an in-memory spooler; nothing on this host is changed
    #[arg(long)]
    pub dry_run: bool,

    /// Write a JSON registry snapshot here after every reconciliation pass
    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded file.
    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(mode) = self.autoshutdown {
            config.auto_shutdown = mode.into();
        }
        if let Some(secs) = self.autoshutdown_timeout {
            config.auto_shutdown_timeout_secs = secs;
        }
        if let Some(path) = &self.status_file {
            config.status_file = Some(path.clone());
        }
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}
