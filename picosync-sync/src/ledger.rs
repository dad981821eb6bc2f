//! Upload ledger: SHA-256 of the content last uploaded per key.
//!
//! Lives for one connection only. The device may be edited or wiped behind
//! our back between connections, so a new connection starts empty.

use std::collections::HashMap;
use std::path::Path;

use picosync_core::TaskKey;
use sha2::{Digest, Sha256};

use crate::error::{io_err, SyncError};

/// Maps a key to the hex digest of the content last uploaded under it.
#[derive(Debug, Default, Clone)]
pub struct UploadLedger {
    uploaded: HashMap<TaskKey, String>,
}

impl UploadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when `digest` is exactly what the device already holds.
    pub fn is_current(&self, key: &TaskKey, digest: &str) -> bool {
        self.uploaded.get(key).map(String::as_str) == Some(digest)
    }

    pub fn record(&mut self, key: TaskKey, digest: String) {
        self.uploaded.insert(key, digest);
    }

    /// Forget `key` and every key beneath it.
    pub fn forget(&mut self, key: &TaskKey) {
        self.uploaded.retain(|k, _| k != key && !k.is_inside(key));
    }

    pub fn clear(&mut self) {
        self.uploaded.clear();
    }

    pub fn len(&self) -> usize {
        self.uploaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty()
    }
}

/// Hex SHA-256 of a file's current content.
pub fn file_digest(path: &Path) -> Result<String, SyncError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
