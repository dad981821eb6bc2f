//! picosync: keep a Raspberry Pi Pico in step with a local MicroPython tree.
//!
//! # Usage
//!
//! ```text
//! picosync init <dir> [--ext .py]... [--no-subdirs] [--no-auto-sync]
//! picosync config show | set <key> <value>
//! picosync devices
//! picosync daemon start|stop|status
//! picosync status [--json]
//! picosync sync | reset | wipe --yes | ls [dir]
//! picosync push <file> | rm <remote>
//! picosync log [--lines N] [--raw]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigCommand, daemon::DaemonCommand, init::InitArgs, log::LogArgs, remote::LsArgs,
    remote::PushArgs, remote::RmArgs, remote::WipeArgs, status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "picosync",
    version,
    about = "Mirror a local MicroPython project onto a connected Raspberry Pi Pico",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Choose the local directory to mirror and its filters.
    Init(InitArgs),

    /// Show or edit ~/.picosync/config.yaml.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// List serial devices and BOOTSEL volumes seen on this machine.
    Devices,

    /// Run or control the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Show device, queue, and failed tasks.
    Status(StatusArgs),

    /// Upload the whole sync root now.
    Sync,

    /// Soft-reset the board.
    Reset,

    /// Delete every file in the device root.
    Wipe(WipeArgs),

    /// List files on the device.
    Ls(LsArgs),

    /// Upload one file from the sync root now.
    Push(PushArgs),

    /// Remove a file or directory on the device.
    Rm(RmArgs),

    /// Show recent sync events.
    Log(LogArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Config { command } => commands::config::run(command),
        Commands::Devices => commands::devices::run(),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Status(args) => args.run(),
        Commands::Sync => commands::remote::sync(),
        Commands::Reset => commands::remote::reset(),
        Commands::Wipe(args) => args.run(),
        Commands::Ls(args) => args.run(),
        Commands::Push(args) => args.run(),
        Commands::Rm(args) => args.run(),
        Commands::Log(args) => args.run(),
    }
}
