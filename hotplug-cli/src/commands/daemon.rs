//! `hotplug daemon` — run the daemon in the foreground, stop it, query it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use hotplug_daemon::{request_stop, start_blocking, DaemonError, DaemonOptions};

use super::status::StatusArgs;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (dispatch loop + control socket).
    Start(StartArgs),
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Worker pool size (overrides `children_max` in config.yaml).
    #[arg(long)]
    pub children_max: Option<usize>,

    /// Rules program run once per event (overrides `rules_program`).
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Also read JSON device lines from stdin.
    #[arg(long)]
    pub stdin: bool,
}

impl From<StartArgs> for DaemonOptions {
    fn from(args: StartArgs) -> Self {
        Self {
            children_max: args.children_max,
            rules_program: args.rules,
            read_stdin: args.stdin,
        }
    }
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = hotplug_core::home_dir()?;

    match command {
        DaemonCommand::Start(args) => {
            start_blocking(&home, args.into()).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status(args) => args.run(&home)?,
    }

    Ok(())
}
