//! Domain types for the sync engine.
//!
//! Local paths are always `PathBuf`; device-side identity is the normalized
//! relative [`TaskKey`] (forward slashes, no `.`/`..` components).

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Normalized path of a file relative to the sync root, e.g. `lib/helper.py`.
///
/// This is the coalescing key of the sync queue and, prefixed with `:`, the
/// remote path on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey(pub String);

impl TaskKey {
    /// Build a key from a path relative to the sync root.
    ///
    /// Returns `None` for empty paths and for paths that escape the root
    /// (`..`, absolute, or prefixed components).
    pub fn from_relative(rel: &Path) -> Option<Self> {
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    /// Build a key for `path` located under `root`.
    pub fn under_root(root: &Path, path: &Path) -> Option<Self> {
        path.strip_prefix(root).ok().and_then(Self::from_relative)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of directory levels below the sync root (`main.py` → 0).
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }

    /// `true` when `self` lies strictly inside the directory named by `dir`.
    pub fn is_inside(&self, dir: &TaskKey) -> bool {
        self.0.len() > dir.0.len() + 1
            && self.0.starts_with(&dir.0)
            && self.0.as_bytes()[dir.0.len()] == b'/'
    }

    /// Parent directory keys from the outermost inward (`a/b/c.py` → `a`, `a/b`).
    pub fn parent_dirs(&self) -> Vec<TaskKey> {
        let mut dirs = Vec::new();
        for (idx, ch) in self.0.char_indices() {
            if ch == '/' {
                dirs.push(TaskKey(self.0[..idx].to_string()));
            }
        }
        dirs
    }

    /// Device-side path in `mpremote` notation (`:lib/helper.py`).
    pub fn remote_path(&self) -> String {
        format!(":{}", self.0)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a queued task does on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Upload,
    Delete,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Upload => write!(f, "upload"),
            TaskKind::Delete => write!(f, "delete"),
        }
    }
}

/// Who put a task on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrigin {
    /// A debounced filesystem change.
    Watcher,
    /// Full-tree resync after a new connection.
    Resync,
    /// Explicit user request (`picosync sync`).
    Manual,
}

/// Board family, derived from USB ids or the device's machine string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PicoModel {
    /// RP2040.
    Pico,
    /// RP2350.
    Pico2,
    #[default]
    Unknown,
}

impl PicoModel {
    /// Map free text mentioning the chip (`INFO_UF2.TXT`, `sys.implementation._machine`).
    pub fn from_chip_text(text: &str) -> Self {
        let upper = text.to_ascii_uppercase();
        if upper.contains("RP2350") {
            PicoModel::Pico2
        } else if upper.contains("RP2040") {
            PicoModel::Pico
        } else {
            PicoModel::Unknown
        }
    }
}

impl fmt::Display for PicoModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PicoModel::Pico => write!(f, "Pico (RP2040)"),
            PicoModel::Pico2 => write!(f, "Pico 2 (RP2350)"),
            PicoModel::Unknown => write!(f, "unknown model"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One pending device operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub key: TaskKey,
    /// Absolute local path.
    pub path: PathBuf,
    pub kind: TaskKind,
    pub origin: TaskOrigin,
    pub enqueued_at: DateTime<Utc>,
}

impl SyncTask {
    pub fn new(key: TaskKey, path: PathBuf, kind: TaskKind, origin: TaskOrigin) -> Self {
        Self {
            key,
            path,
            kind,
            origin,
            enqueued_at: Utc::now(),
        }
    }

    pub fn upload(key: TaskKey, path: PathBuf, origin: TaskOrigin) -> Self {
        Self::new(key, path, TaskKind::Upload, origin)
    }

    pub fn delete(key: TaskKey, path: PathBuf, origin: TaskOrigin) -> Self {
        Self::new(key, path, TaskKind::Delete, origin)
    }
}

/// Connection state as last reported by the device monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceState {
    pub connected: bool,
    pub port_id: Option<String>,
    pub model: PicoModel,
}

impl DeviceState {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn connected(port: impl Into<String>, model: PicoModel) -> Self {
        Self {
            connected: true,
            port_id: Some(port.into()),
            model,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_nested_relative_path_uses_forward_slashes() {
        let key = TaskKey::from_relative(&Path::new("lib").join("helper.py")).unwrap();
        assert_eq!(key.as_str(), "lib/helper.py");
        assert_eq!(key.depth(), 1);
        assert_eq!(key.remote_path(), ":lib/helper.py");
    }

    #[test]
    fn key_rejects_escaping_paths() {
        assert!(TaskKey::from_relative(Path::new("../secret.py")).is_none());
        assert!(TaskKey::from_relative(Path::new("")).is_none());
        assert!(TaskKey::from_relative(Path::new("/abs/main.py")).is_none());
    }

    #[test]
    fn key_under_root_strips_prefix() {
        let root = Path::new("/work/project");
        let key = TaskKey::under_root(root, Path::new("/work/project/./main.py")).unwrap();
        assert_eq!(key, TaskKey::from("main.py"));
        assert!(TaskKey::under_root(root, Path::new("/elsewhere/main.py")).is_none());
    }

    #[test]
    fn inside_requires_separator_boundary() {
        let dir = TaskKey::from("lib");
        assert!(TaskKey::from("lib/a.py").is_inside(&dir));
        assert!(!TaskKey::from("library.py").is_inside(&dir));
        assert!(!TaskKey::from("lib").is_inside(&dir));
    }

    #[test]
    fn parent_dirs_are_outermost_first() {
        let key = TaskKey::from("a/b/c.py");
        assert_eq!(
            key.parent_dirs(),
            vec![TaskKey::from("a"), TaskKey::from("a/b")]
        );
        assert!(TaskKey::from("main.py").parent_dirs().is_empty());
    }

    #[test]
    fn model_from_chip_text() {
        assert_eq!(PicoModel::from_chip_text("Model: Raspberry Pi RP2350"), PicoModel::Pico2);
        assert_eq!(PicoModel::from_chip_text("Raspberry Pi Pico with rp2040"), PicoModel::Pico);
        assert_eq!(PicoModel::from_chip_text("ESP32"), PicoModel::Unknown);
    }

    #[test]
    fn task_kind_serializes_lowercase() {
        let yaml = serde_yaml::to_string(&TaskKind::Delete).expect("serialize");
        assert_eq!(yaml.trim(), "delete");
    }
}
