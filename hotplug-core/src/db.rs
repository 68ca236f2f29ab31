//! On-disk device database and tag index.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   data/
//!     <key>.json        (one record per device, mode 0600)
//!   tags/
//!     <tag>/
//!       <key>           (empty marker file)
//! ```
//!
//! `<key>` is the devpath without its leading `/`, with every `/` replaced by
//! `!` (`/devices/usb1/1-1` → `devices!usb1!1-1`). A `<tag>` is always one
//! path component; see [`is_valid_tag`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{db_io_err, DbError};
use crate::types::{Action, DevPath, Device, SeqNum, Terminal};

/// Final state of a device as written after its event completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub seqnum: SeqNum,
    pub terminal: Terminal,
    pub updated_at: DateTime<Utc>,
    pub device: Device,
}

impl DeviceRecord {
    pub fn new(seqnum: SeqNum, terminal: Terminal, device: Device) -> Self {
        Self {
            seqnum,
            terminal,
            updated_at: Utc::now(),
            device,
        }
    }
}

/// Device database used by the finalizer. Calls are synchronous and may block.
pub trait DeviceDb: Send + Sync + 'static {
    /// Store the final state of a device; a `remove` drops the record.
    fn persist(&self, record: &DeviceRecord) -> Result<(), DbError>;

    /// Drop every index entry that still points at `device`.
    fn remove_from_index(&self, device: &Device) -> Result<(), DbError>;
}

/// [`DeviceDb`] backed by plain files under one directory.
#[derive(Debug, Clone)]
pub struct FileDeviceDb {
    root: PathBuf,
}

impl FileDeviceDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    /// `<root>/data/<key>.json`. Pure, no I/O.
    pub fn record_path(&self, devpath: &DevPath) -> PathBuf {
        self.data_dir().join(format!("{}.json", db_key(devpath)))
    }

    /// `<root>/tags/<tag>/<key>`. Pure, no I/O.
    pub fn tag_path(&self, tag: &str, devpath: &DevPath) -> Result<PathBuf, DbError> {
        Ok(self.tag_dir(tag)?.join(db_key(devpath)))
    }

    fn tag_dir(&self, tag: &str) -> Result<PathBuf, DbError> {
        if !is_valid_tag(tag) {
            return Err(DbError::InvalidTag(tag.to_string()));
        }
        Ok(self.tags_dir().join(tag))
    }

    /// Load the record for `devpath`, `None` when absent.
    pub fn load(&self, devpath: &DevPath) -> Result<Option<DeviceRecord>, DbError> {
        let path = self.record_path(devpath);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(db_io_err(&path, err)),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Keys of every device currently carrying `tag`, sorted.
    pub fn tagged(&self, tag: &str) -> Result<Vec<String>, DbError> {
        let dir = self.tag_dir(tag)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(db_io_err(&dir, err)),
        };
        let mut keys: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn write_record(&self, record: &DeviceRecord) -> Result<(), DbError> {
        let dir = self.data_dir();
        ensure_dir(&dir)?;
        let path = self.record_path(&record.device.devpath);
        let tmp_path = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp_path, json).map_err(|e| db_io_err(&tmp_path, e))?;
        set_file_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &path).map_err(|e| db_io_err(&path, e))?;
        Ok(())
    }

    fn delete_record(&self, devpath: &DevPath) -> Result<(), DbError> {
        let path = self.record_path(devpath);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(db_io_err(&path, err)),
        }
    }

    /// Drop the record and tag markers stored under `devpath`.
    fn forget(&self, devpath: &DevPath) -> Result<(), DbError> {
        if let Some(old) = self.load(devpath)? {
            for tag in &old.device.tags {
                remove_marker(&self.tag_path(tag, devpath)?)?;
            }
        }
        self.delete_record(devpath)
    }

    fn sync_tags(&self, device: &Device, previous: &BTreeSet<String>) -> Result<(), DbError> {
        for stale in previous.difference(&device.tags) {
            remove_marker(&self.tag_path(stale, &device.devpath)?)?;
        }
        for tag in &device.tags {
            let marker = self.tag_path(tag, &device.devpath)?;
            if let Some(parent) = marker.parent() {
                ensure_dir(parent)?;
            }
            std::fs::write(&marker, b"").map_err(|e| db_io_err(&marker, e))?;
        }
        Ok(())
    }
}

impl DeviceDb for FileDeviceDb {
    fn persist(&self, record: &DeviceRecord) -> Result<(), DbError> {
        let device = &record.device;
        if device.action == Action::Remove {
            return self.delete_record(&device.devpath);
        }
        if let Some(bad) = device.tags.iter().find(|tag| !is_valid_tag(tag)) {
            return Err(DbError::InvalidTag(bad.clone()));
        }
        let previous = self
            .load(&device.devpath)?
            .map(|old| old.device.tags)
            .unwrap_or_default();
        self.write_record(record)?;
        self.sync_tags(device, &previous)?;

        // A moved device is only known under its new path.
        match &device.devpath_old {
            Some(old) if *old != device.devpath => self.forget(old),
            _ => Ok(()),
        }
    }

    fn remove_from_index(&self, device: &Device) -> Result<(), DbError> {
        let dir = self.tags_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(db_io_err(&dir, err)),
        };
        let key = db_key(&device.devpath);
        for entry in entries {
            let entry = entry.map_err(|e| db_io_err(&dir, e))?;
            remove_marker(&entry.path().join(&key))?;
        }
        Ok(())
    }
}

/// Whether `tag` can name its own directory under `tags/`.
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty() && tag != "." && tag != ".." && !tag.contains(['/', '\\', '\0'])
}

/// File name used for a devpath inside the database.
pub fn db_key(devpath: &DevPath) -> String {
    devpath.as_str().trim_start_matches('/').replace('/', "!")
}

fn ensure_dir(dir: &Path) -> Result<(), DbError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| db_io_err(dir, e))?;
    }
    Ok(())
}

fn remove_marker(path: &Path) -> Result<(), DbError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(db_io_err(path, err)),
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), DbError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| db_io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), DbError> {
    Ok(())
}
