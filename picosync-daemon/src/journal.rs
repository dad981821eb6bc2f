//! JSON-lines event journal with size-based rotation.
//!
//! `events.jsonl` (and the daemon's stdout/stderr logs) rotate when they
//! exceed 10 MiB, keeping at most 5 numbered copies:
//!   events.jsonl → events.jsonl.1 → … → events.jsonl.5

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::events::EventRecord;

/// Maximum file size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 5;

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line.
    pub fn append(&self, record: &EventRecord) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

/// Last `lines` lines of `path` (fewer if the file is shorter). A missing file
/// yields nothing.
pub fn tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut last = VecDeque::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line?;
        if lines == 0 {
            continue;
        }
        if last.len() == lines {
            last.pop_front();
        }
        last.push_back(line);
    }
    Ok(last.into())
}

/// Rotate `log_path` if its size exceeds `max_bytes`.
///
/// Returns `true` if rotation occurred, `false` if the file was under the
/// threshold (or did not exist yet).
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }

    fs::rename(log_path, numbered_path(log_path, 1))?;
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;

    Ok(true)
}

/// Rotate the journal and both daemon logs under `home`.
///
/// Errors for one file are logged as warnings and do not block the others.
pub fn rotate_logs(home: &Path) {
    let files = [
        crate::paths::journal_path(home),
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
    ];
    for log_path in &files {
        match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed"),
        }
    }
}

/// Path of the `n`-th rotated copy of `base` (e.g. `events.jsonl.2`).
fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("events.jsonl");
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use chrono::Utc;
    use tempfile::TempDir;

    fn oversized(path: &Path, fill: u8) {
        fs::write(path, vec![fill; MAX_LOG_BYTES as usize + 1]).unwrap();
    }

    #[test]
    fn append_then_tail() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path().join("logs").join("events.jsonl"));
        for reason in ["a", "b", "c"] {
            journal
                .append(&EventRecord {
                    at: Utc::now(),
                    event: SyncEvent::WatcherFailed {
                        reason: reason.into(),
                    },
                })
                .unwrap();
        }
        let lines = tail(journal.path(), 2).unwrap();
        assert_eq!(lines.len(), 2);
        let last: EventRecord = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(
            last.event,
            SyncEvent::WatcherFailed {
                reason: "c".into()
            }
        );
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(tail(&dir.path().join("none.jsonl"), 10).unwrap().is_empty());
    }

    #[test]
    fn small_file_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("events.jsonl");
        fs::write(&log, "{}\n").unwrap();
        assert!(!rotate_if_needed(&log, MAX_LOG_BYTES, MAX_ROTATED_FILES).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn sequential_rotations_shift_and_cap_backups() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("events.jsonl");
        for round in 0..7u8 {
            oversized(&log, b'0' + round);
            assert!(rotate_if_needed(&log, MAX_LOG_BYTES, MAX_ROTATED_FILES).unwrap());
        }
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        for n in 1..=MAX_ROTATED_FILES {
            assert!(numbered_path(&log, n).exists(), "backup .{n} missing");
        }
        assert!(!numbered_path(&log, MAX_ROTATED_FILES + 1).exists());
        // Newest backup holds the last round's content.
        let newest = fs::read(numbered_path(&log, 1)).unwrap();
        assert_eq!(newest[0], b'6');
    }
}
