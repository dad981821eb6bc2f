//! Error types for picosync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading, saving, or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.picosync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("no sync root directory configured; run `picosync init <dir>` first")]
    RootUnset,

    #[error("sync root directory does not exist: {path}")]
    RootMissing { path: PathBuf },

    #[error("sync root is not a directory: {path}")]
    RootNotDirectory { path: PathBuf },

    #[error("extension filter is empty; at least one extension (e.g. .py) is required")]
    NoExtensions,

    #[error("unknown settings key '{key}'")]
    UnknownKey { key: String },

    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
