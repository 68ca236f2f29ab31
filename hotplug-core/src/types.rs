//! Domain types shared by the daemon, the device database and the CLI.
//!
//! A [`Device`] is a snapshot of one kernel device as reported by a change
//! notification. Devices serialize to JSON for the control socket, the
//! monitor stream and the on-disk database.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Sequence number assigned to an event when it enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum(pub u64);

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for SeqNum {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

/// Absolute sysfs-style device path, e.g. `/devices/pci0000:00/usb1/1-1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevPath(pub String);

impl DevPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `self` sits strictly below `other` in the device tree.
    ///
    /// Compares whole path components: `/devices/usb1` is not an ancestor of
    /// `/devices/usb10`.
    pub fn is_descendant_of(&self, other: &DevPath) -> bool {
        let ancestor = other.0.trim_end_matches('/');
        self.0.len() > ancestor.len()
            && self.0.starts_with(ancestor)
            && self.0.as_bytes()[ancestor.len()] == b'/'
    }

    /// Last path component (`1-1` for `/devices/usb1/1-1`).
    pub fn sysname(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for DevPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DevPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DevPath {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of device transition carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
            Action::Move => "move",
            Action::Online => "online",
            Action::Offline => "offline",
            Action::Bind => "bind",
            Action::Unbind => "unbind",
        };
        f.write_str(name)
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(Action::Add),
            "remove" => Ok(Action::Remove),
            "change" => Ok(Action::Change),
            "move" => Ok(Action::Move),
            "online" => Ok(Action::Online),
            "offline" => Ok(Action::Offline),
            "bind" => Ok(Action::Bind),
            "unbind" => Ok(Action::Unbind),
            other => Err(format!(
                "unknown action '{other}'; expected: add, remove, change, move, online, offline, bind, unbind"
            )),
        }
    }
}

/// Block and character device numbers live in separate namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevNumKind {
    Block,
    Char,
}

/// Major/minor pair of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevNum {
    pub kind: DevNumKind,
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            DevNumKind::Block => 'b',
            DevNumKind::Char => 'c',
        };
        write!(f, "{prefix}{}:{}", self.major, self.minor)
    }
}

// ---------------------------------------------------------------------------
// Device snapshot
// ---------------------------------------------------------------------------

/// Snapshot of a device as seen by one change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub devpath: DevPath,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub subsystem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devtype: Option<String>,
    /// Previous devpath of a moved device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devpath_old: Option<DevPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devnum: Option<DevNum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,
    /// Causal parent, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<DevPath>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Device {
    pub fn new(devpath: impl Into<DevPath>, action: Action, subsystem: impl Into<String>) -> Self {
        Self {
            devpath: devpath.into(),
            action,
            subsystem: subsystem.into(),
            devtype: None,
            devpath_old: None,
            devnum: None,
            ifindex: None,
            parent: None,
            tags: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<DevPath>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_devnum(mut self, kind: DevNumKind, major: u32, minor: u32) -> Self {
        self.devnum = Some(DevNum { kind, major, minor });
        self
    }

    pub fn with_ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = Some(ifindex);
        self
    }

    pub fn with_devpath_old(mut self, old: impl Into<DevPath>) -> Self {
        self.devpath_old = Some(old.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Worker results
// ---------------------------------------------------------------------------

/// Result class reported by the rule runner for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RuleEngineFailure(String),
    /// The device is held by another program; the event must be retried.
    DeviceLocked,
}

/// What the rule runner hands back: the resulting device and how it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub device: Device,
    pub outcome: Outcome,
}

impl Execution {
    pub fn success(device: Device) -> Self {
        Self {
            device,
            outcome: Outcome::Success,
        }
    }

    pub fn failed(device: Device, reason: impl Into<String>) -> Self {
        Self {
            device,
            outcome: Outcome::RuleEngineFailure(reason.into()),
        }
    }

    pub fn locked(device: Device) -> Self {
        Self {
            device,
            outcome: Outcome::DeviceLocked,
        }
    }
}

/// Why a terminal event did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum FailureKind {
    RuleEngine(String),
    /// Killed after exceeding the hard deadline.
    WorkerTimeout,
    /// Still locked after the retry ceiling forced a run.
    LockTimeout,
    /// Aborted because the daemon shut down.
    Shutdown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::RuleEngine(reason) => write!(f, "rule engine failure: {reason}"),
            FailureKind::WorkerTimeout => f.write_str("worker timed out"),
            FailureKind::LockTimeout => f.write_str("device stayed locked"),
            FailureKind::Shutdown => f.write_str("aborted by shutdown"),
        }
    }
}

/// Terminal result of an event as persisted and broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum Terminal {
    Succeeded,
    Failed(FailureKind),
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        matches!(self, Terminal::Succeeded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendant_respects_component_boundaries() {
        let parent = DevPath::from("/devices/pci0000:00/usb1");
        assert!(DevPath::from("/devices/pci0000:00/usb1/1-1").is_descendant_of(&parent));
        assert!(!DevPath::from("/devices/pci0000:00/usb10").is_descendant_of(&parent));
        assert!(!parent.is_descendant_of(&parent));
    }

    #[test]
    fn trailing_slash_on_ancestor_is_ignored() {
        let parent = DevPath::from("/devices/virtual/");
        assert!(DevPath::from("/devices/virtual/net/lo").is_descendant_of(&parent));
    }

    #[test]
    fn sysname_is_last_component() {
        assert_eq!(DevPath::from("/devices/usb1/1-1").sysname(), "1-1");
    }

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!("ADD".parse::<Action>().unwrap(), Action::Add);
        assert_eq!(Action::Unbind.to_string(), "unbind");
        assert!("plug".parse::<Action>().is_err());
    }

    #[test]
    fn device_json_omits_empty_fields() {
        let device = Device::new("/devices/virtual/net/lo", Action::Add, "net").with_ifindex(1);
        let json = serde_json::to_value(&device).expect("serialize");
        assert_eq!(json["action"], "add");
        assert_eq!(json["ifindex"], 1);
        assert!(json.get("tags").is_none());
        assert!(json.get("devnum").is_none());
    }

    #[test]
    fn device_json_fills_defaults() {
        let device: Device =
            serde_json::from_str(r#"{"devpath":"/devices/usb1"}"#).expect("deserialize");
        assert_eq!(device.action, Action::Add);
        assert!(device.subsystem.is_empty());
        assert!(device.properties.is_empty());
    }

    #[test]
    fn devnum_display() {
        let dev = Device::new("/devices/sda", Action::Add, "block").with_devnum(DevNumKind::Block, 8, 0);
        assert_eq!(dev.devnum.expect("devnum").to_string(), "b8:0");
    }
}
