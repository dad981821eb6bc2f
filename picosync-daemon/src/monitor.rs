//! Periodic device polling.
//!
//! Each tick lists serial devices through the tool and looks for a BOOTSEL
//! volume, both on the blocking pool. Every poll report goes to the
//! dispatcher (it clears the "device suspect" flag); BOOTSEL only on change.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use picosync_core::EngineSettings;
use picosync_device::bootsel::{self, BootselVolume};
use picosync_device::{DeviceMonitor, DeviceTool};

use crate::dispatcher::Input;
use crate::error::DaemonError;

pub async fn monitor_task(
    tool: Arc<dyn DeviceTool>,
    engine: EngineSettings,
    pinned_port: Option<String>,
    mount_roots: Vec<PathBuf>,
    inputs: mpsc::Sender<Input>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut monitor = Some(DeviceMonitor::new(engine.disconnect_after_polls, pinned_port));
    let mount_roots = Arc::new(mount_roots);
    let mut bootsel: Option<BootselVolume> = None;

    let mut interval = tokio::time::interval(engine.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let Some(mut current) = monitor.take() else { break };
                let tool = tool.clone();
                let roots = mount_roots.clone();
                let (returned, report, volume) = tokio::task::spawn_blocking(move || {
                    let report = current.poll(tool.as_ref());
                    let volume = bootsel::find_volume(&roots);
                    (current, report, volume)
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("device poll join error: {err}")))?;
                monitor = Some(returned);

                if inputs.send(Input::Poll(report)).await.is_err() {
                    break;
                }
                if volume != bootsel {
                    bootsel = volume.clone();
                    if inputs.send(Input::Bootsel(volume)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
