//! Which local paths take part in a sync session, and under which key.

use std::path::{Path, PathBuf};

use picosync_core::{ConfigError, SyncConfig, TaskKey};

/// Eligibility rules of one session, bound to the canonical root.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    config: SyncConfig,
}

impl PathFilter {
    /// Validate `config` and bind it to its canonical root.
    pub fn new(config: SyncConfig) -> Result<Self, ConfigError> {
        let root = config.validate()?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Key for any path inside the root that respects the subdirectory rule.
    ///
    /// Hidden components (`.git`, `.main.py.swp`) and editor backups (`main.py~`)
    /// never qualify.
    pub fn key_for(&self, path: &Path) -> Option<TaskKey> {
        let key = TaskKey::under_root(&self.root, path)?;
        if !self.config.include_subdirs && key.depth() > 0 {
            return None;
        }
        let ignored = key
            .as_str()
            .split('/')
            .any(|part| part.starts_with('.') || part.ends_with('~'));
        if ignored {
            return None;
        }
        Some(key)
    }

    /// Key for a file that should be mirrored (extension filter applied).
    pub fn file_key(&self, path: &Path) -> Option<TaskKey> {
        if !self.config.matches_extension(path) {
            return None;
        }
        self.key_for(path)
    }

    /// Key for a directory whose contents are mirrored.
    pub fn dir_key(&self, path: &Path) -> Option<TaskKey> {
        if !self.config.include_subdirs {
            return None;
        }
        self.key_for(path)
    }

    /// Local absolute path for `key`.
    pub fn local_path(&self, key: &TaskKey) -> PathBuf {
        key.as_str()
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}
