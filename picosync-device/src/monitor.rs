//! Debounced device connection tracking.
//!
//! A board is reported connected on the first poll that lists it and
//! disconnected only after `disconnect_after` consecutive polls without it.
//! Listing failures count as empty polls and carry a diagnostic.

use picosync_core::{DeviceState, PicoModel};

use crate::error::ToolError;
use crate::tool::{DeviceListing, DeviceTool};

/// A change of [`DeviceState::connected`] worth acting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// New connection (or the board re-enumerated on another port).
    Connected(DeviceState),
    Disconnected,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub state: DeviceState,
    pub transition: Option<Transition>,
    /// Set when the listing call itself failed.
    pub diagnostic: Option<String>,
}

#[derive(Debug)]
pub struct DeviceMonitor {
    state: DeviceState,
    misses: u32,
    disconnect_after: u32,
    pinned_port: Option<String>,
}

impl DeviceMonitor {
    pub fn new(disconnect_after: u32, pinned_port: Option<String>) -> Self {
        Self {
            state: DeviceState::disconnected(),
            misses: 0,
            disconnect_after: disconnect_after.max(1),
            pinned_port,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// List devices through `tool` and fold the result into the state.
    pub fn poll(&mut self, tool: &dyn DeviceTool) -> PollReport {
        let listing = tool.list_devices();
        self.observe(listing)
    }

    pub fn observe(&mut self, listing: Result<Vec<DeviceListing>, ToolError>) -> PollReport {
        let (found, diagnostic) = match listing {
            Ok(devices) => (self.pick(&devices), None),
            Err(err) => (None, Some(format!("device listing failed: {err}"))),
        };

        let transition = match found {
            Some((port, model)) => {
                self.misses = 0;
                let same_port = self.state.port_id.as_deref() == Some(port.as_str());
                if self.state.connected && same_port {
                    None
                } else {
                    self.state = DeviceState::connected(port, model);
                    tracing::info!("device connected on {:?} ({})", self.state.port_id, model);
                    Some(Transition::Connected(self.state.clone()))
                }
            }
            None if self.state.connected => {
                self.misses += 1;
                if self.misses >= self.disconnect_after {
                    self.misses = 0;
                    tracing::info!("device disconnected from {:?}", self.state.port_id);
                    self.state = DeviceState::disconnected();
                    Some(Transition::Disconnected)
                } else {
                    None
                }
            }
            None => None,
        };

        PollReport {
            state: self.state.clone(),
            transition,
            diagnostic,
        }
    }

    fn pick(&self, devices: &[DeviceListing]) -> Option<(String, PicoModel)> {
        devices
            .iter()
            .filter(|d| {
                self.pinned_port
                    .as_deref()
                    .map(|pinned| pinned == d.port)
                    .unwrap_or(true)
            })
            .find_map(|d| d.pico_model().map(|model| (d.port.clone(), model)))
    }
}
