//! Device side of picosync.
//!
//! - [`tool`]: the [`DeviceTool`] capability the engine drives
//! - [`mpremote`]: [`DeviceTool`] over the `mpremote` command line
//! - [`ident`]: USB vendor/product ids → [`PicoModel`](picosync_core::PicoModel)
//! - [`monitor`]: debounced connect/disconnect detection
//! - [`bootsel`]: boards sitting in BOOTSEL mass-storage mode

pub mod bootsel;
pub mod error;
pub mod ident;
pub mod monitor;
pub mod mpremote;
pub mod tool;

pub use error::{FailureClass, ToolError};
pub use monitor::{DeviceMonitor, PollReport, Transition};
pub use mpremote::Mpremote;
pub use tool::{DeviceListing, DeviceTool, RemoteEntry};
