//! # picosync-sync
//!
//! Everything between a filesystem event and a device call:
//! eligibility filtering, burst coalescing, the coalescing [`SyncQueue`], and
//! the retrying [`TransferExecutor`].

pub mod debounce;
pub mod error;
pub mod executor;
pub mod filter;
pub mod ledger;
pub mod queue;
pub mod scan;

pub use debounce::{ChangeKind, Debouncer};
pub use error::{SyncError, TransferError};
pub use executor::{RetryPolicy, TransferExecutor, TransferOutcome};
pub use filter::PathFilter;
pub use ledger::UploadLedger;
pub use queue::{Admission, Drain, QueueState, SyncQueue};
pub use scan::{resync_tasks, scan_dir, scan_tree};
