//! Error types for picosync-sync.

use std::path::PathBuf;

use thiserror::Error;

use picosync_core::ConfigError;

/// Errors from local-side work (scanning, hashing).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal failure of one transfer after the retry policy ran out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The board went away; the task should wait for the next connection.
    #[error("device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    /// Timeouts or busy responses on every allowed attempt.
    #[error("gave up after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },

    /// Not retried: bad path, device full, read-only filesystem, missing tool.
    #[error("{reason}")]
    Permanent { reason: String },
}

impl TransferError {
    pub fn reason(&self) -> &str {
        match self {
            TransferError::DeviceUnavailable { reason }
            | TransferError::Transient { reason, .. }
            | TransferError::Permanent { reason } => reason,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
