//! Settings persistence and the per-session [`SyncConfig`] snapshot.
//!
//! # Storage layout
//!
//! ```text
//! ~/.picosync/
//!   config.yaml   (settings: mode 0600, written atomically)
//! ```
//!
//! # API pattern
//!
//! Every filesystem function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

pub const SETTINGS_FILE: &str = "config.yaml";

// ---------------------------------------------------------------------------
// 1. Types
// ---------------------------------------------------------------------------

/// What to mirror. Cloned into each sync session and never mutated there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub root_directory: Option<PathBuf>,
    /// Lowercase, dot-prefixed (`.py`).
    #[serde(default = "default_extensions")]
    pub include_extensions: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub include_subdirs: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_directory: None,
            include_extensions: default_extensions(),
            include_subdirs: true,
        }
    }
}

/// Timing and retry knobs of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub poll_interval_ms: u64,
    /// Consecutive empty polls before a connected device is reported gone.
    pub disconnect_after_polls: u32,
    /// Quiet window per path before a burst of file events is handed off.
    pub coalesce_window_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub transfer_timeout_secs: u64,
    /// Soft-reset the board after a fully successful resync.
    pub reset_after_resync: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            disconnect_after_polls: 3,
            coalesce_window_ms: 400,
            max_attempts: 3,
            retry_backoff_ms: 500,
            transfer_timeout_secs: 20,
            reset_after_resync: false,
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// The external device-transfer program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub program: String,
    /// Fixed serial port; `None` follows whatever the monitor detects.
    pub port: Option<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: "mpremote".to_string(),
            port: None,
        }
    }
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub tool: ToolSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            auto_sync: true,
            engine: EngineSettings::default(),
            tool: ToolSettings::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> BTreeSet<String> {
    BTreeSet::from([".py".to_string()])
}

// ---------------------------------------------------------------------------
// 2. Validation and filtering helpers
// ---------------------------------------------------------------------------

/// Normalize a user-supplied extension: `PY`, `py`, `.py`, `*.py` → `.py`.
pub fn normalize_extension(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('*').trim_start_matches('.');
    if trimmed.is_empty() || trimmed.contains(['/', '\\', '.']) {
        return None;
    }
    Some(format!(".{}", trimmed.to_ascii_lowercase()))
}

impl SyncConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.include_extensions = extensions
            .into_iter()
            .filter_map(|ext| normalize_extension(ext.as_ref()))
            .collect();
        self
    }

    pub fn with_subdirs(mut self, include: bool) -> Self {
        self.include_subdirs = include;
        self
    }

    /// Rewrite hand-edited extensions (`PY`, `py`, `*.py`) into `.py` form.
    pub fn normalize_extensions(&mut self) -> Result<(), ConfigError> {
        let mut normalized = BTreeSet::new();
        for raw in &self.include_extensions {
            let ext = normalize_extension(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "include_extensions".to_string(),
                value: raw.clone(),
                reason: "expected a file extension such as .py".to_string(),
            })?;
            normalized.insert(ext);
        }
        self.include_extensions = normalized;
        Ok(())
    }

    /// Fail fast on an unusable configuration; returns the canonical root.
    pub fn validate(&self) -> Result<PathBuf, ConfigError> {
        let root = self.root_directory.as_ref().ok_or(ConfigError::RootUnset)?;
        if self.include_extensions.is_empty() {
            return Err(ConfigError::NoExtensions);
        }
        let meta = match std::fs::metadata(root) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::RootMissing { path: root.clone() })
            }
            Err(err) => return Err(io_err(root, err)),
        };
        if !meta.is_dir() {
            return Err(ConfigError::RootNotDirectory { path: root.clone() });
        }
        std::fs::canonicalize(root).map_err(|e| io_err(root, e))
    }

    /// Case-insensitive extension check on the file name.
    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.include_extensions
                    .contains(&format!(".{}", ext.to_ascii_lowercase()))
            })
            .unwrap_or(false)
    }
}

impl Settings {
    /// Apply a `picosync config set <key> <value>` edit.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let flag = || parse_bool(value).ok_or_else(|| invalid("expected true/false"));
        let positive = || parse_positive(value).ok_or_else(|| invalid("expected a positive integer"));
        let count = || {
            parse_positive(value)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| invalid("expected a positive integer"))
        };

        match key {
            "root" | "root_directory" => self.sync.root_directory = Some(PathBuf::from(value)),
            "extensions" | "include_extensions" => {
                let mut set = BTreeSet::new();
                for raw in value.split(',').filter(|s| !s.trim().is_empty()) {
                    set.insert(normalize_extension(raw).ok_or_else(|| invalid("bad extension"))?);
                }
                if set.is_empty() {
                    return Err(ConfigError::NoExtensions);
                }
                self.sync.include_extensions = set;
            }
            "subdirs" | "include_subdirs" => self.sync.include_subdirs = flag()?,
            "auto_sync" => self.auto_sync = flag()?,
            "reset_after_resync" => self.engine.reset_after_resync = flag()?,
            "poll_interval_ms" => self.engine.poll_interval_ms = positive()?,
            "disconnect_after_polls" => self.engine.disconnect_after_polls = count()?,
            "coalesce_window_ms" => self.engine.coalesce_window_ms = positive()?,
            "max_attempts" => self.engine.max_attempts = count()?,
            "retry_backoff_ms" => {
                self.engine.retry_backoff_ms =
                    value.parse().map_err(|_| invalid("expected an integer"))?
            }
            "transfer_timeout_secs" => self.engine.transfer_timeout_secs = positive()?,
            "tool" | "program" => self.tool.program = value.to_string(),
            "port" => {
                self.tool.port = match value {
                    "" | "auto" => None,
                    port => Some(port.to_string()),
                }
            }
            other => {
                return Err(ConfigError::UnknownKey {
                    key: other.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_positive(value: &str) -> Option<u64> {
    value.parse::<u64>().ok().filter(|v| *v > 0)
}

// ---------------------------------------------------------------------------
// 3. Paths
// ---------------------------------------------------------------------------

/// `<home>/.picosync/`
pub fn picosync_root(home: &Path) -> PathBuf {
    home.join(".picosync")
}

/// `<home>/.picosync/config.yaml`: pure, no I/O.
pub fn settings_path_at(home: &Path) -> PathBuf {
    picosync_root(home).join(SETTINGS_FILE)
}

// ---------------------------------------------------------------------------
// 4. Load / save
// ---------------------------------------------------------------------------

/// Load settings; a missing file yields [`Settings::default`].
///
/// Returns `ConfigError::Parse` (with path + line context) if malformed YAML,
/// and `ConfigError::InvalidValue` for an extension that cannot be normalized.
pub fn load_at(home: &Path) -> Result<Settings, ConfigError> {
    let path = settings_path_at(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let mut settings: Settings =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    settings.sync.normalize_extensions()?;
    Ok(settings)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Settings, ConfigError> {
    load_at(&home()?)
}

/// Save settings atomically: write `config.yaml.tmp`, then rename.
pub fn save_at(home: &Path, settings: &Settings) -> Result<PathBuf, ConfigError> {
    let dir = picosync_root(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let path = settings_path_at(home);
    let yaml = serde_yaml::to_string(settings)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(settings: &Settings) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, settings)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
