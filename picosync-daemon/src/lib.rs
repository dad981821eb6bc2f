//! picosync daemon: device monitor + change watcher + single-consumer
//! dispatcher + socket server.

pub mod dispatcher;
mod error;
pub mod events;
pub mod journal;
mod monitor;
pub mod paths;
pub mod protocol;
mod runtime;
mod session;
mod watcher;

pub use dispatcher::{Control, Dispatcher, FailedTask, Input};
pub use error::DaemonError;
pub use events::{EventRecord, EventSink, FailureKind, SyncEvent};
pub use journal::Journal;
pub use protocol::{
    request_ls, request_push, request_reload, request_reset, request_rm, request_status,
    request_stop, request_sync, request_wipe, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, serve, start_blocking};
