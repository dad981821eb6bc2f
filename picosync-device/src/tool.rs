//! The device-transfer capability the sync engine drives.
//!
//! Every method blocks until the tool finishes or its own bounded wait
//! expires; callers run them off the async runtime (`spawn_blocking`).

use std::path::Path;

use picosync_core::PicoModel;
use serde::Serialize;

use crate::error::ToolError;
use crate::ident;

/// One serial device reported by the tool's device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceListing {
    pub port: String,
    pub serial: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// Manufacturer and product strings as printed by the tool.
    pub description: String,
}

impl DeviceListing {
    /// `None` when the device is not a Raspberry Pi board.
    pub fn pico_model(&self) -> Option<PicoModel> {
        ident::classify(self.vid, self.pid, &self.description)
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

/// Device operations. Remote paths use `:`-prefixed notation (`:lib/a.py`).
///
/// Calls block until the device answers; async callers go through
/// `spawn_blocking`.
pub trait DeviceTool: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceListing>, ToolError>;

    fn copy_file(&self, port: &str, local: &Path, remote: &str) -> Result<(), ToolError>;

    /// Remove a file or, recursively, a directory.
    fn remove_path(&self, port: &str, remote: &str) -> Result<(), ToolError>;

    fn make_dir(&self, port: &str, remote: &str) -> Result<(), ToolError>;

    fn reset(&self, port: &str) -> Result<(), ToolError>;

    fn list_dir(&self, port: &str, remote: &str) -> Result<Vec<RemoteEntry>, ToolError>;

    /// Remove every regular file in the device root.
    fn wipe(&self, port: &str) -> Result<(), ToolError>;

    /// The firmware's machine string, e.g. `Raspberry Pi Pico with RP2040`.
    fn machine(&self, port: &str) -> Result<String, ToolError>;
}
