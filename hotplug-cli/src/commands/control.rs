use anyhow::{Context, Result};
use clap::Subcommand;

use hotplug_daemon::{request_ping, request_set_paused};

#[derive(Subcommand, Debug)]
pub enum ControlCommand {
    /// Stop starting new events; running ones finish.
    Pause,
    /// Start queued events again.
    Resume,
    /// Check that the daemon answers on its socket.
    Ping,
}

pub fn run(command: ControlCommand) -> Result<()> {
    let home = hotplug_core::home_dir()?;

    match command {
        ControlCommand::Pause | ControlCommand::Resume => {
            let want = matches!(command, ControlCommand::Pause);
            let paused = request_set_paused(&home, want).context("failed to change daemon state")?;
            println!("{}", if paused { "paused" } else { "resumed" });
        }
        ControlCommand::Ping => {
            request_ping(&home).context("daemon did not answer")?;
            println!("pong");
        }
    }
    Ok(())
}
