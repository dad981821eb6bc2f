use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// How the engine should react to a failed tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The board is gone; wait for the next connection.
    DeviceUnavailable,
    /// Worth another attempt (timeout, port busy, raw REPL not ready).
    Transient,
    /// Retrying will not help (bad path, device full, read-only).
    Permanent,
}

/// Failure of one device-transfer tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("device tool '{program}' is not installed or not on PATH")]
    NotInstalled { program: String },

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {}s", after.as_secs())]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} failed (exit {}): {message}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed {
        operation: &'static str,
        code: Option<i32>,
        message: String,
    },

    #[error("local file not found: {path}")]
    LocalMissing { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const UNAVAILABLE_MARKERS: &[&str] = &[
    "no device found",
    "could not open port",
    "no such file or directory: '/dev/",
    "device not configured",
    "device disconnected",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "failed to access",
    "resource busy",
    "device busy",
    "timed out",
    "timeout",
    "could not enter raw repl",
    "serialexception",
    "input/output error",
];

impl ToolError {
    pub fn classify(&self) -> FailureClass {
        match self {
            ToolError::TimedOut { .. } => FailureClass::Transient,
            ToolError::NotInstalled { .. }
            | ToolError::Spawn { .. }
            | ToolError::LocalMissing { .. }
            | ToolError::Io { .. } => FailureClass::Permanent,
            ToolError::Failed { message, .. } => {
                let lower = message.to_ascii_lowercase();
                if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
                    FailureClass::DeviceUnavailable
                } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
        }
    }

    /// The device reported that the remote path does not exist.
    pub fn is_remote_missing(&self) -> bool {
        self.message_contains(&["enoent", "errno 2]", "no such file or directory"])
            && self.classify() != FailureClass::DeviceUnavailable
    }

    /// The device reported that the remote path already exists (`mkdir`).
    pub fn is_already_exists(&self) -> bool {
        self.message_contains(&["eexist", "errno 17]", "file exists"])
    }

    fn message_contains(&self, needles: &[&str]) -> bool {
        match self {
            ToolError::Failed { message, .. } => {
                let lower = message.to_ascii_lowercase();
                needles.iter().any(|n| lower.contains(n))
            }
            _ => false,
        }
    }
}
