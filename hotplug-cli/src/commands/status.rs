//! `hotplug daemon status` — engine counters and daemon metadata.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use hotplug_daemon::paths::socket_path;
use hotplug_daemon::{request_status, DaemonError};

/// Arguments for `hotplug daemon status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Render a table instead of JSON.
    #[arg(long)]
    pub table: bool,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "metric")]
    metric: String,
    #[tabled(rename = "value")]
    value: String,
}

impl StatusArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let status = match request_status(home) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => json!({
                "running": false,
                "socket": socket_path(home).display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.table {
            print_table(&status);
        } else {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            );
        }
        Ok(())
    }
}

fn print_table(status: &Value) {
    if status["running"] != json!(true) {
        println!("hotplug daemon {}", "not running".red().bold());
        return;
    }

    let engine = &status["engine"];
    let state = if engine["paused"] == json!(true) {
        "paused".yellow().bold()
    } else {
        "running".green().bold()
    };
    println!(
        "hotplug v{} | {} | pid {} | {}/{} workers busy",
        env!("CARGO_PKG_VERSION"),
        state,
        status["pid"],
        engine["busy_workers"],
        engine["workers"],
    );

    let mut rows = vec![
        row("queued", &engine["queued"]),
        row("running", &engine["running"]),
        row("deferred", &engine["deferred"]),
    ];
    if let Some(stats) = engine["stats"].as_object() {
        rows.extend(stats.iter().map(|(name, value)| row(name, value)));
    }
    rows.push(row("monitors", &status["monitors"]));

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("{}", format!("socket: {}", status["socket"].as_str().unwrap_or("?")).bright_black());
}

fn row(metric: &str, value: &Value) -> StatusRow {
    StatusRow {
        metric: metric.replace('_', " "),
        value: match value {
            Value::String(s) => s.clone(),
            Value::Null => "-".to_string(),
            other => other.to_string(),
        },
    }
}
