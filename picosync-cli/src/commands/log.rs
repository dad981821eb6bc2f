//! `picosync log`: tail of the event journal.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use colored::{ColoredString, Colorize};

use picosync_daemon::paths::journal_path;
use picosync_daemon::{journal, EventRecord, SyncEvent};

use super::home;

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Number of trailing events to show.
    #[arg(long, short = 'n', default_value_t = 50)]
    pub lines: usize,

    /// Print the JSON lines as stored.
    #[arg(long)]
    pub raw: bool,
}

impl LogArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let path = journal_path(&home);
        let lines = journal::tail(&path, self.lines)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if lines.is_empty() {
            println!("no events recorded yet ({})", path.display());
            return Ok(());
        }

        for line in lines {
            if self.raw {
                println!("{line}");
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(record) => println!("{}", render(&record)),
                // Lines from another version: show them untouched.
                Err(_) => println!("{line}"),
            }
        }
        Ok(())
    }
}

fn render(record: &EventRecord) -> String {
    let at = record.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
    let (label, detail) = describe(&record.event);
    format!("{at}  {label:<12}  {detail}")
}

fn describe(event: &SyncEvent) -> (ColoredString, String) {
    match event {
        SyncEvent::SessionStarted { root, watching } => (
            "session".cyan(),
            format!(
                "started on {}{}",
                root.display(),
                if *watching { "" } else { " (not watching)" }
            ),
        ),
        SyncEvent::SessionStopped { discarded } => (
            "session".cyan(),
            format!("stopped, {discarded} queued task(s) discarded"),
        ),
        SyncEvent::DeviceConnected { port, model } => {
            ("device".green(), format!("connected on {port} ({model})"))
        }
        SyncEvent::DeviceIdentified { model, machine } => {
            ("device".green(), format!("identified as {model}: {machine}"))
        }
        SyncEvent::DeviceDisconnected { port } => (
            "device".yellow(),
            format!("disconnected from {}", port.as_deref().unwrap_or("?")),
        ),
        SyncEvent::MonitorDiagnostic { message } => ("monitor".yellow(), message.clone()),
        SyncEvent::BootselDetected { path, model } => (
            "bootsel".yellow(),
            format!("{} volume at {}", model, path.display()),
        ),
        SyncEvent::BootselCleared => ("bootsel".normal(), "volume gone".to_string()),
        SyncEvent::ResyncStarted { origin, files } => (
            "resync".cyan(),
            format!("{files} file(s) queued ({origin:?})").to_lowercase(),
        ),
        SyncEvent::ResyncCompleted { failed } => {
            let label = if *failed == 0 { "resync".green() } else { "resync".red() };
            (label, format!("completed, {failed} failed"))
        }
        SyncEvent::TaskQueued {
            key,
            kind,
            queue_len,
        } => ("queued".normal(), format!("{kind} {key} ({queue_len} pending)")),
        SyncEvent::TaskSucceeded {
            key,
            kind,
            attempts,
            skipped,
        } => {
            if *skipped {
                ("skipped".bright_black(), format!("{kind} {key} (unchanged)"))
            } else {
                ("ok".green(), format!("{kind} {key} ({attempts} attempt(s))"))
            }
        }
        SyncEvent::TaskFailed {
            key,
            kind,
            failure,
            reason,
        } => (
            "failed".red().bold(),
            format!("{kind} {key} [{failure:?}]: {reason}"),
        ),
        SyncEvent::TaskRequeued { key } => ("requeued".yellow(), format!("{key} waits for the device")),
        SyncEvent::DeviceReset => ("device".green(), "soft reset".to_string()),
        SyncEvent::DeviceWiped => ("device".red(), "root wiped".to_string()),
        SyncEvent::RemoteRemoved { key } => ("device".yellow(), format!("removed :{key}")),
        SyncEvent::WatcherFailed { reason } => ("watcher".red().bold(), reason.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picosync_core::TaskKind;

    #[test]
    fn skipped_upload_is_labelled() {
        colored::control::set_override(false);
        let (label, detail) = describe(&SyncEvent::TaskSucceeded {
            key: "main.py".into(),
            kind: TaskKind::Upload,
            attempts: 0,
            skipped: true,
        });
        assert_eq!(label.to_string(), "skipped");
        assert_eq!(detail, "upload main.py (unchanged)");
    }
}
