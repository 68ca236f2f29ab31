//! Error types for hotplug-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure reading the config file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value that parses but cannot be used.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors from the device database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization of a device record.
    #[error("device record JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database cannot be reached right now.
    #[error("device database unavailable: {0}")]
    Unavailable(String),

    /// A tag that cannot name a directory under `tags/`.
    #[error("invalid tag {0:?}: tags must be a single non-empty path component")]
    InvalidTag(String),
}

/// Convenience constructor for [`DbError::Io`].
pub(crate) fn db_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DbError {
    DbError::Io {
        path: path.into(),
        source,
    }
}
