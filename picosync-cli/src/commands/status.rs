//! `picosync status`: device, session, queue and failed tasks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use picosync_core::config;
use picosync_daemon::{request_status, DaemonError};

use super::home;

/// Arguments for `picosync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit the daemon's status payload as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct FailedRow {
    #[tabled(rename = "path")]
    key: String,
    #[tabled(rename = "task")]
    kind: String,
    #[tabled(rename = "failure")]
    failure: String,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "when")]
    when: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let status = match request_status(&home) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let settings = config::load_at(&home).context("failed to load settings")?;
                let root = settings
                    .sync
                    .root_directory
                    .map(|p| p.display().to_string());
                json!({ "running": false, "root": root })
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render status JSON")?
            );
            return Ok(());
        }
        print_report(&status);
        Ok(())
    }
}

fn print_report(status: &Value) {
    if status["running"] != json!(true) {
        println!("{} daemon is not running", "■".bright_black().bold());
        match status["root"].as_str() {
            Some(root) => println!("  sync root: {root}"),
            None => println!("  no sync root configured; run `picosync init <dir>`"),
        }
        println!("  start it with `picosync daemon start`");
        return;
    }

    println!(
        "picosync v{} | {} | queue {}",
        env!("CARGO_PKG_VERSION"),
        device_line(status),
        queue_line(&status["queue"]),
    );

    let session = &status["session"];
    if session.is_null() {
        println!("  no sync session (auto-sync off and no root configured)");
    } else {
        let extensions: Vec<&str> = session["extensions"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let watching = if session["watching"] == json!(true) {
            "watching".green().to_string()
        } else {
            "not watching".yellow().to_string()
        };
        println!(
            "  root {} ({}; subdirs {}; auto-sync {}; {})",
            session["root"].as_str().unwrap_or("?"),
            extensions.join(" "),
            flag(&session["include_subdirs"]),
            flag(&session["auto_sync"]),
            watching,
        );
    }

    if let Some(bootsel) = status["bootsel"].as_object() {
        println!(
            "  {} BOOTSEL volume at {}",
            "!".yellow().bold(),
            bootsel.get("path").and_then(Value::as_str).unwrap_or("?")
        );
    }
    if let Some(message) = status["diagnostic"].as_str() {
        println!("  {} {message}", "!".yellow().bold());
    }
    if let Some(key) = status["queue"]["in_flight"].as_str() {
        println!("  in flight: {key}");
    }
    if status["resync"].is_object() {
        println!(
            "  resync: {} file(s) remaining, {} failed",
            status["resync"]["remaining"], status["resync"]["failed"]
        );
    }
    if let Some(last) = status["last_result"].as_object() {
        let mark = if last.get("ok") == Some(&json!(true)) {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        println!(
            "  last: {mark} {} {} {}",
            last.get("kind").and_then(Value::as_str).unwrap_or("?"),
            last.get("key").and_then(Value::as_str).unwrap_or("?"),
            age(last.get("at").unwrap_or(&Value::Null)),
        );
    }

    let failed: Vec<FailedRow> = status["failed"]
        .as_array()
        .map(|rows| rows.iter().map(failed_row).collect())
        .unwrap_or_default();
    if !failed.is_empty() {
        println!("{}", format!("{} failed task(s)", failed.len()).red().bold());
        let mut table = Table::new(failed);
        table.with(Style::rounded());
        println!("{table}");
        println!("Edit the file again or run 'picosync sync' to retry.");
    }
}

fn device_line(status: &Value) -> String {
    let device = &status["device"];
    if device["connected"] != json!(true) {
        return format!("{} no device", "■".bright_black().bold());
    }
    let model = match device["model"].as_str() {
        Some("pico") => "Pico (RP2040)",
        Some("pico2") => "Pico 2 (RP2350)",
        _ => "Pico (model unknown)",
    };
    format!(
        "{} {model} on {}",
        "■".green().bold(),
        device["port_id"].as_str().unwrap_or("?")
    )
}

fn queue_line(queue: &Value) -> String {
    let pending = queue["pending"].as_u64().unwrap_or(0);
    match queue["state"].as_str() {
        Some("draining") => format!("{} ({pending} pending)", "draining".cyan()),
        _ if pending > 0 => format!("{} ({pending} pending)", "paused".yellow()),
        _ => "idle".to_string(),
    }
}

fn failed_row(row: &Value) -> FailedRow {
    let text = |field: &str| row[field].as_str().unwrap_or("?").to_string();
    FailedRow {
        key: text("key"),
        kind: text("kind"),
        failure: text("failure").replace('_', " "),
        reason: text("reason"),
        when: age(&row["at"]),
    }
}

fn flag(value: &Value) -> &'static str {
    if value == &json!(true) {
        "on"
    } else {
        "off"
    }
}

/// "just now", "5m ago", "3h ago", "2d ago".
fn age(at: &Value) -> String {
    let Some(at) = at
        .as_str()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
    else {
        return String::new();
    };
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => "just now".to_string(),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
