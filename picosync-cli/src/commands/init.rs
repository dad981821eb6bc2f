//! `picosync init <dir> [--ext .py]... [--no-subdirs] [--no-auto-sync]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use picosync_core::{config, SyncConfig};

use super::{home, reload_daemon};

/// Choose the local directory mirrored onto the board.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory holding the MicroPython project.
    pub dir: PathBuf,

    /// File extension to sync (repeatable). Defaults to .py.
    #[arg(long = "ext", short = 'e', value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Only sync files directly in the root directory.
    #[arg(long)]
    pub no_subdirs: bool,

    /// Do not watch for changes or resync on connect.
    #[arg(long)]
    pub no_auto_sync: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let root = self
            .dir
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.dir.display()))?;

        let mut settings = config::load_at(&home).context("failed to load settings")?;
        let mut sync = SyncConfig::new(&root).with_subdirs(!self.no_subdirs);
        if !self.extensions.is_empty() {
            sync = sync.with_extensions(&self.extensions);
        }
        sync.validate()
            .with_context(|| format!("'{}' cannot be used as sync root", root.display()))?;
        settings.sync = sync;
        settings.auto_sync = !self.no_auto_sync;

        let path = config::save_at(&home, &settings).context("failed to save settings")?;
        let extensions: Vec<&str> = settings
            .sync
            .include_extensions
            .iter()
            .map(String::as_str)
            .collect();
        println!("✓ Sync root set to '{}'", root.display());
        println!(
            "  extensions: {} | subdirectories: {} | auto-sync: {}",
            extensions.join(" "),
            on_off(settings.sync.include_subdirs),
            on_off(settings.auto_sync),
        );
        println!("  Saved to: {}", path.display());

        reload_daemon(&home)
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
