//! hotplug core library — device types, configuration, device database.
//!
//! - [`types`] — devices, actions, sequence numbers, outcomes
//! - [`config`] — [`DaemonConfig`]
//! - [`db`] — [`DeviceDb`] and the file-backed [`FileDeviceDb`]
//! - [`error`] — [`ConfigError`], [`DbError`]

pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use config::{home_dir, DaemonConfig, LogFormat};
pub use db::{DeviceDb, DeviceRecord, FileDeviceDb};
pub use error::{ConfigError, DbError};
pub use types::{
    Action, DevNum, DevNumKind, DevPath, Device, Execution, FailureKind, Outcome, SeqNum, Terminal,
};
