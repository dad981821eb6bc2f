//! Device operations routed through the daemon: `sync`, `reset`, `wipe`,
//! `ls`, `push`, `rm`.
//!
//! The daemon owns the serial connection, so these never talk to the board
//! directly; they queue behind any transfer already running.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use picosync_daemon::{
    request_ls, request_push, request_reset, request_rm, request_sync, request_wipe,
};

use super::{home, with_daemon};

pub fn sync() -> Result<()> {
    let home = home()?;
    let reply = with_daemon(request_sync(&home), "sync failed")?;
    println!(
        "✓ queued {} file(s) for upload",
        reply["queued"].as_u64().unwrap_or(0)
    );
    Ok(())
}

pub fn reset() -> Result<()> {
    let home = home()?;
    with_daemon(request_reset(&home), "reset failed")?;
    println!("✓ board reset");
    Ok(())
}

#[derive(Args, Debug)]
pub struct WipeArgs {
    /// Confirm deletion of every file in the device root.
    #[arg(long)]
    pub yes: bool,
}

impl WipeArgs {
    pub fn run(self) -> Result<()> {
        if !self.yes {
            bail!("wipe deletes every file in the device root; pass --yes to confirm");
        }
        let home = home()?;
        with_daemon(request_wipe(&home), "wipe failed")?;
        println!("{} device root wiped", "✓".green());
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Local file inside the sync root.
    pub file: PathBuf,
}

impl PushArgs {
    pub fn run(self) -> Result<()> {
        let file = self
            .file
            .canonicalize()
            .with_context(|| format!("cannot resolve path {}", self.file.display()))?;
        let home = home()?;
        let reply = with_daemon(request_push(&home, &file), "push failed")?;
        println!(
            "✓ queued {} for upload",
            reply["queued"].as_str().unwrap_or("?")
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct RmArgs {
    /// File or directory on the device, relative to its root.
    pub remote: String,
}

impl RmArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let reply = with_daemon(request_rm(&home, &self.remote), "rm failed")?;
        println!(
            "{} removed :{}",
            "✓".green(),
            reply["removed"].as_str().unwrap_or(&self.remote)
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Remote directory, relative to the device root.
    pub dir: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "size")]
    size: String,
}

impl LsArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let entries = with_daemon(request_ls(&home, self.dir.clone()), "ls failed")?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        let rows: Vec<EntryRow> = entries
            .as_array()
            .map(|list| list.iter().map(entry_row).collect())
            .unwrap_or_default();
        let location = self.dir.as_deref().unwrap_or("/");
        if rows.is_empty() {
            println!("{location}: empty");
            return Ok(());
        }
        println!("{location}");
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn entry_row(entry: &Value) -> EntryRow {
    let name = entry["name"].as_str().unwrap_or("?");
    if entry["is_dir"] == Value::Bool(true) {
        EntryRow {
            name: format!("{name}/").blue().bold().to_string(),
            size: "-".to_string(),
        }
    } else {
        EntryRow {
            name: name.to_string(),
            size: entry["size"]
                .as_u64()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string()),
        }
    }
}
