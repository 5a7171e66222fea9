//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be turned into usable settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being loaded.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        /// File that was being loaded.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Merged values do not fit the settings shape, e.g. a string where a
    /// port number belongs.
    #[error("settings have the wrong shape: {0}")]
    Decode(#[from] serde_json::Error),
    /// Validation found error-level issues.
    #[error("{count} invalid setting(s): {summary}")]
    Invalid {
        /// Number of error-level issues.
        count: usize,
        /// `field: message` pairs joined with `; `.
        summary: String,
    },
    /// The file watcher could not be set up.
    #[error("cannot watch settings file: {0}")]
    Watch(#[from] notify::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
