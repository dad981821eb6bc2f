pub mod config;
pub mod daemon;
pub mod devices;
pub mod init;
pub mod log;
pub mod remote;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;

use picosync_daemon::{request_reload, DaemonError};

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Tell a running daemon to pick up saved settings. A stopped daemon reads
/// them at its next start.
pub fn reload_daemon(home: &Path) -> Result<()> {
    match request_reload(home) {
        Ok(reply) => {
            if reply["restarted"].as_bool() == Some(true) {
                let discarded = reply["discarded"].as_u64().unwrap_or(0);
                println!(
                    "{} daemon restarted its sync session ({discarded} queued task(s) discarded)",
                    "↻".cyan()
                );
            }
            Ok(())
        }
        Err(DaemonError::DaemonNotRunning { .. }) => Ok(()),
        Err(err) => Err(err).context("daemon rejected the new settings"),
    }
}

/// Map "daemon not running" to a hint instead of a bare socket error.
pub fn with_daemon<T>(result: Result<T, DaemonError>, action: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(DaemonError::DaemonNotRunning { .. }) => Err(anyhow::anyhow!(
            "{action}: daemon is not running (start it with `picosync daemon start`)"
        )),
        Err(err) => Err(err).context(action.to_string()),
    }
}
