//! `hotplug trigger` — inject a synthetic device change.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use hotplug_core::{Action, Device};
use hotplug_daemon::{request_settle, request_trigger};

use crate::PropertyArg;

#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Kernel-style device path, e.g. /devices/virtual/block/loop0
    pub devpath: String,

    /// add, remove, change, move, online, offline, bind or unbind
    #[arg(long, default_value = "change")]
    pub action: Action,

    #[arg(long, default_value = "")]
    pub subsystem: String,

    #[arg(long)]
    pub devtype: Option<String>,

    /// Causal parent devpath.
    #[arg(long)]
    pub parent: Option<String>,

    /// Previous devpath, for `move` events.
    #[arg(long)]
    pub devpath_old: Option<String>,

    /// Device property, repeatable.
    #[arg(long = "property", value_name = "KEY=VALUE")]
    pub properties: Vec<PropertyArg>,

    /// Device tag, repeatable.
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Wait for the queue to empty before returning.
    #[arg(long)]
    pub settle: bool,
}

impl TriggerArgs {
    pub fn run(self) -> Result<()> {
        let home = hotplug_core::home_dir()?;
        let settle = self.settle;
        let device = self.into_device();
        let label = format!("{} {}", device.action, device.devpath);

        request_trigger(&home, device).context("failed to queue device event")?;
        println!("{} {}", "queued".green().bold(), label);

        if settle {
            request_settle(&home, Some(Duration::from_secs(super::settle::DEFAULT_TIMEOUT_SECS)))
                .context("failed to settle after trigger")?;
            println!("{}", "settled".green());
        }
        Ok(())
    }

    fn into_device(self) -> Device {
        let mut device = Device::new(self.devpath, self.action, self.subsystem);
        device.devtype = self.devtype;
        if let Some(parent) = self.parent {
            device = device.with_parent(parent);
        }
        if let Some(old) = self.devpath_old {
            device = device.with_devpath_old(old);
        }
        for tag in self.tags {
            device = device.with_tag(tag);
        }
        for PropertyArg { key, value } in self.properties {
            device = device.with_property(key, value);
        }
        device
    }
}
