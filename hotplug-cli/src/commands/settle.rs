use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use hotplug_daemon::request_settle;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Args, Debug)]
pub struct SettleArgs {
    /// Seconds to wait before giving up (0 waits forever).
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,
}

impl SettleArgs {
    pub fn run(self) -> Result<()> {
        let home = hotplug_core::home_dir()?;
        let timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
        request_settle(&home, timeout).context("event queue did not settle")?;
        Ok(())
    }
}
