//! Enumerate eligible files for a full-tree resync or a new directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use picosync_core::{SyncTask, TaskKey, TaskOrigin};

use crate::error::{io_err, SyncError};
use crate::filter::PathFilter;

/// Every eligible file under the sync root, sorted by key.
pub fn scan_tree(filter: &PathFilter) -> Result<Vec<(TaskKey, PathBuf)>, SyncError> {
    scan_dir(filter, filter.root())
}

/// Every eligible file under `dir` (recursively when subdirectories are
/// included), sorted by key. A directory that vanished mid-scan yields
/// whatever was found before it disappeared.
pub fn scan_dir(filter: &PathFilter, dir: &Path) -> Result<Vec<(TaskKey, PathBuf)>, SyncError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let path = entry.path();
            let ty = match entry.file_type() {
                Ok(ty) => ty,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&path, err)),
            };
            if ty.is_dir() {
                if filter.dir_key(&path).is_some() {
                    pending.push(path);
                }
            } else if ty.is_file() {
                if let Some(key) = filter.file_key(&path) {
                    files.push((key, path));
                }
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Upload tasks for every eligible file, in key order.
pub fn resync_tasks(filter: &PathFilter, origin: TaskOrigin) -> Result<Vec<SyncTask>, SyncError> {
    Ok(scan_tree(filter)?
        .into_iter()
        .map(|(key, path)| SyncTask::upload(key, path, origin))
        .collect())
}
