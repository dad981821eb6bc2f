//! One sync session: a validated [`picosync_core::SyncConfig`] snapshot plus
//! the watcher subscribed to its root.
//!
//! The snapshot is never mutated. Changing the root, the filters, or auto-sync
//! stops the current session and opens a new one with the next generation
//! number, so late watcher output of the old session can be told apart.

use tokio::sync::mpsc;

use picosync_core::Settings;
use picosync_sync::PathFilter;

use crate::dispatcher::Input;
use crate::error::DaemonError;
use crate::watcher::{self, WatcherHandle};

#[derive(Debug)]
pub struct SyncSession {
    filter: PathFilter,
    auto_sync: bool,
    generation: u64,
    watcher: Option<WatcherHandle>,
}

impl SyncSession {
    /// Open a session for `settings`.
    ///
    /// Returns `Ok(None)` when there is nothing to do (no root and auto-sync
    /// off). With auto-sync on, an invalid configuration is an error.
    pub fn open(
        settings: &Settings,
        generation: u64,
        watch: bool,
        inputs: &mpsc::Sender<Input>,
    ) -> Result<Option<Self>, DaemonError> {
        if settings.sync.root_directory.is_none() && !settings.auto_sync {
            return Ok(None);
        }
        let filter = PathFilter::new(settings.sync.clone())?;
        let watcher = if settings.auto_sync && watch {
            Some(watcher::spawn(
                filter.clone(),
                settings.engine.coalesce_window(),
                generation,
                inputs.clone(),
            )?)
        } else {
            None
        };
        tracing::info!(
            root = %filter.root().display(),
            generation,
            auto_sync = settings.auto_sync,
            "sync session started",
        );
        Ok(Some(Self {
            filter,
            auto_sync: settings.auto_sync,
            generation,
            watcher,
        }))
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub fn auto_sync(&self) -> bool {
        self.auto_sync
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.as_ref().is_some_and(WatcherHandle::is_running)
    }

    /// The watcher gave up; keep the session but stop expecting changes.
    pub fn watcher_failed(&mut self) {
        self.watcher = None;
    }

    pub fn stop(self) {
        if let Some(watcher) = self.watcher {
            watcher.stop();
        }
        tracing::info!(generation = self.generation, "sync session stopped");
    }
}
