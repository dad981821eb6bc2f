//! `picosync devices`: what the daemon's monitor would see, without the daemon.

use anyhow::{Context, Result};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use picosync_core::config;
use picosync_device::{bootsel, DeviceListing, DeviceTool, Mpremote};

use super::home;

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "port")]
    port: String,
    #[tabled(rename = "board")]
    board: String,
    #[tabled(rename = "usb id")]
    usb_id: String,
    #[tabled(rename = "serial")]
    serial: String,
    #[tabled(rename = "description")]
    description: String,
}

pub fn run() -> Result<()> {
    let home = home()?;
    let settings = config::load_at(&home).context("failed to load settings")?;
    let tool = Mpremote::from_settings(&settings.tool, &settings.engine);

    let devices = tool
        .list_devices()
        .with_context(|| format!("failed to list devices with '{}'", tool.program()))?;
    if devices.is_empty() {
        println!("No serial devices found.");
    } else {
        let rows: Vec<DeviceRow> = devices.iter().map(row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }
    if let Some(port) = &settings.tool.port {
        println!("Pinned port: {port}");
    }

    match bootsel::find_volume(&bootsel::default_mount_roots()) {
        Some(volume) => println!(
            "{} BOOTSEL volume at {} ({}): ready for a UF2 image, not for file sync",
            "!".yellow().bold(),
            volume.path.display(),
            volume.model,
        ),
        None => println!("No BOOTSEL volume mounted."),
    }
    Ok(())
}

fn row(device: &DeviceListing) -> DeviceRow {
    let board = match device.pico_model() {
        Some(model) => model.to_string().green().to_string(),
        None => "-".bright_black().to_string(),
    };
    let usb_id = match (device.vid, device.pid) {
        (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
        _ => "-".to_string(),
    };
    DeviceRow {
        port: device.port.clone(),
        board,
        usb_id,
        serial: device.serial.clone().unwrap_or_else(|| "-".to_string()),
        description: device.description.clone(),
    }
}
