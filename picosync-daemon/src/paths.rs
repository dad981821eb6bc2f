use std::path::{Path, PathBuf};

pub use picosync_core::config::picosync_root;

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const EVENT_JOURNAL: &str = "events.jsonl";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    picosync_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    picosync_root(home).join("logs")
}

pub fn journal_path(home: &Path) -> PathBuf {
    logs_dir(home).join(EVENT_JOURNAL)
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}
