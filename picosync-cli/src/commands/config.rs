//! `picosync config show | set <key> <value>`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use picosync_core::{config, Settings};

use super::{home, reload_daemon};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective settings.
    Show(ShowArgs),
    /// Change one setting (e.g. `extensions .py,.json`, `port /dev/ttyACM0`).
    Set { key: String, value: String },
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct SettingRow {
    #[tabled(rename = "key")]
    key: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    let home = home()?;
    match command {
        ConfigCommand::Show(args) => {
            let settings = config::load_at(&home).context("failed to load settings")?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&settings).context("failed to render settings")?
                );
            } else {
                println!("{}", config::settings_path_at(&home).display());
                let mut table = Table::new(rows(&settings));
                table.with(Style::rounded());
                println!("{table}");
            }
        }
        ConfigCommand::Set { key, value } => {
            let mut settings = config::load_at(&home).context("failed to load settings")?;
            settings
                .set_key(&key, &value)
                .with_context(|| format!("cannot set '{key}'"))?;
            if settings.sync.root_directory.is_some() {
                let root = settings.sync.validate().context("invalid sync root")?;
                settings.sync.root_directory = Some(root);
            }
            config::save_at(&home, &settings).context("failed to save settings")?;
            println!("✓ {key} = {value}");
            reload_daemon(&home)?;
        }
    }
    Ok(())
}

fn rows(settings: &Settings) -> Vec<SettingRow> {
    let engine = &settings.engine;
    let extensions: Vec<&str> = settings
        .sync
        .include_extensions
        .iter()
        .map(String::as_str)
        .collect();
    vec![
        SettingRow {
            key: "root",
            value: settings
                .sync
                .root_directory
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unset)".to_string()),
        },
        SettingRow {
            key: "extensions",
            value: extensions.join(","),
        },
        SettingRow {
            key: "subdirs",
            value: settings.sync.include_subdirs.to_string(),
        },
        SettingRow {
            key: "auto_sync",
            value: settings.auto_sync.to_string(),
        },
        SettingRow {
            key: "program",
            value: settings.tool.program.clone(),
        },
        SettingRow {
            key: "port",
            value: settings.tool.port.clone().unwrap_or_else(|| "auto".to_string()),
        },
        SettingRow {
            key: "poll_interval_ms",
            value: engine.poll_interval_ms.to_string(),
        },
        SettingRow {
            key: "disconnect_after_polls",
            value: engine.disconnect_after_polls.to_string(),
        },
        SettingRow {
            key: "coalesce_window_ms",
            value: engine.coalesce_window_ms.to_string(),
        },
        SettingRow {
            key: "max_attempts",
            value: engine.max_attempts.to_string(),
        },
        SettingRow {
            key: "retry_backoff_ms",
            value: engine.retry_backoff_ms.to_string(),
        },
        SettingRow {
            key: "transfer_timeout_secs",
            value: engine.transfer_timeout_secs.to_string(),
        },
        SettingRow {
            key: "reset_after_resync",
            value: engine.reset_after_resync.to_string(),
        },
    ]
}
