//! # Error Types
//!
//! Only genuinely exceptional conditions are errors here. A rejected request
//! is a [`Decision`](crate::Decision), a dropped log record is a counter, and
//! a skipped task is picked up again on the next scan, so none of those show
//! up below.
//!
//! ```text
//!     ConfigError ──► settings could not be read, parsed or validated
//!     StoreError  ──► the task store failed a query or an update
//!     SpawnError  ──► the OS refused to start a background thread
//!     StartError  ──► any of the above while bringing services up
//! ```

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read settings from {path}: {source}")]
    Read {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The settings document is not valid TOML or does not match the schema.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed fine but is out of range.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field, e.g. `logger.batch_size`.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

/// Errors reported by a [`TaskStore`](crate::TaskStore).
///
/// The worker logs these and moves on; the next scan re-discovers
/// anything that is still eligible.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// The store was reachable but the operation failed.
    #[error("task store operation failed: {0}")]
    Operation(String),
}

/// A background thread could not be spawned.
#[derive(Debug, Error)]
#[error("failed to spawn background thread `{name}`: {source}")]
pub struct SpawnError {
    /// Name of the thread that failed to start.
    pub name: String,
    /// Underlying OS error.
    #[source]
    pub source: io::Error,
}

/// Errors raised by [`Services::start`](crate::Services::start).
#[derive(Debug, Error)]
pub enum StartError {
    /// Settings failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A background loop could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}
