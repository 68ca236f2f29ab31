//! hotplug — device-event coordination daemon and its control client.
//!
//! # Usage
//!
//! ```text
//! hotplug daemon start [--children-max N] [--rules <program>] [--stdin]
//! hotplug daemon stop|status [--table]
//! hotplug trigger <devpath> [--action change] [--subsystem <name>] [--property K=V]... [--tag T]... [--settle]
//! hotplug settle [--timeout <secs>]
//! hotplug monitor [--json] [--count N]
//! hotplug control pause|resume|ping
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    control::ControlCommand, daemon::DaemonCommand, monitor::MonitorArgs, settle::SettleArgs,
    trigger::TriggerArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "hotplug",
    version,
    about = "Order, run and rebroadcast device change events",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or query the hotplug daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Queue a synthetic device change in the running daemon.
    Trigger(TriggerArgs),

    /// Wait until the daemon's event queue is empty.
    Settle(SettleArgs),

    /// Print every device the daemon broadcasts.
    Monitor(MonitorArgs),

    /// Adjust a running daemon.
    Control {
        #[command(subcommand)]
        command: ControlCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared KEY=VALUE argument
// ---------------------------------------------------------------------------

/// `KEY=VALUE` pair parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyArg {
    pub key: String,
    pub value: String,
}

impl FromStr for PropertyArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok(Self {
                key: key.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("expected KEY=VALUE, got '{s}'")),
        }
    }
}

impl fmt::Display for PropertyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Trigger(args) => args.run(),
        Commands::Settle(args) => args.run(),
        Commands::Monitor(args) => args.run(),
        Commands::Control { command } => commands::control::run(command),
    }
}
