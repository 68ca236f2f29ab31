//! `hotplug monitor` — follow devices as the daemon rebroadcasts them.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use colored::Colorize;

use hotplug_core::Device;
use hotplug_daemon::monitor;

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Print each device as one JSON line.
    #[arg(long)]
    pub json: bool,

    /// Exit after this many devices.
    #[arg(long)]
    pub count: Option<usize>,
}

impl MonitorArgs {
    pub fn run(self) -> Result<()> {
        let home = hotplug_core::home_dir()?;
        let mut seen = 0usize;
        let mut failure = None;

        monitor(&home, |device| {
            let line = if self.json {
                serde_json::to_string(&device).map_err(anyhow::Error::from)
            } else {
                Ok(describe(&device))
            };
            match line {
                Ok(line) => println!("{line}"),
                Err(err) => {
                    failure = Some(err);
                    return false;
                }
            }
            seen += 1;
            self.count.map_or(true, |limit| seen < limit)
        })
        .context("monitor connection failed")?;

        match failure {
            Some(err) => Err(err.context("failed to render device")),
            None => Ok(()),
        }
    }
}

fn describe(device: &Device) -> String {
    let mut out = format!(
        "{} {:<8} {} ({})",
        Local::now().format("%H:%M:%S%.3f").to_string().bright_black(),
        device.action.to_string().cyan().bold(),
        device.devpath,
        if device.subsystem.is_empty() { "-" } else { device.subsystem.as_str() },
    );
    for (key, value) in &device.properties {
        out.push_str(&format!("\n    {key}={value}"));
    }
    if !device.tags.is_empty() {
        let tags: Vec<&str> = device.tags.iter().map(String::as_str).collect();
        out.push_str(&format!("\n    tags: {}", tags.join(",")));
    }
    out
}
