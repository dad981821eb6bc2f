//! picosync core library: domain types, settings persistence, errors.
//!
//! - [`types`]: sync tasks, device state, board models
//! - [`config`]: [`Settings`] / [`SyncConfig`] load / save / validate
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineSettings, Settings, SyncConfig, ToolSettings};
pub use error::ConfigError;
pub use types::{DeviceState, PicoModel, SyncTask, TaskKey, TaskKind, TaskOrigin};
