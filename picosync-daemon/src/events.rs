//! Typed status events emitted by the dispatcher.
//!
//! Each event is logged and broadcast to in-process subscribers. When a
//! journal is attached, a writer task appends it to the JSON-lines file off
//! the dispatcher's task.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use picosync_core::{PicoModel, TaskKey, TaskKind, TaskOrigin};

use crate::journal::Journal;

/// Failure taxonomy as reported to the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DeviceUnavailable,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SessionStarted {
        root: PathBuf,
        watching: bool,
    },
    SessionStopped {
        discarded: usize,
    },
    DeviceConnected {
        port: String,
        model: PicoModel,
    },
    DeviceIdentified {
        model: PicoModel,
        machine: String,
    },
    DeviceDisconnected {
        port: Option<String>,
    },
    MonitorDiagnostic {
        message: String,
    },
    BootselDetected {
        path: PathBuf,
        model: PicoModel,
    },
    BootselCleared,
    ResyncStarted {
        origin: TaskOrigin,
        files: usize,
    },
    ResyncCompleted {
        failed: usize,
    },
    TaskQueued {
        key: TaskKey,
        kind: TaskKind,
        queue_len: usize,
    },
    TaskSucceeded {
        key: TaskKey,
        kind: TaskKind,
        attempts: u32,
        skipped: bool,
    },
    TaskFailed {
        key: TaskKey,
        kind: TaskKind,
        failure: FailureKind,
        reason: String,
    },
    TaskRequeued {
        key: TaskKey,
    },
    DeviceReset,
    DeviceWiped,
    RemoteRemoved {
        key: TaskKey,
    },
    WatcherFailed {
        reason: String,
    },
}

/// A [`SyncEvent`] with its timestamp, as written to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SyncEvent,
}

/// Fan-out point for status events.
#[derive(Debug, Clone)]
pub struct EventSink {
    journal: Option<mpsc::UnboundedSender<EventRecord>>,
    tx: broadcast::Sender<EventRecord>,
}

impl EventSink {
    /// Sink without a journal.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { journal: None, tx }
    }

    /// Sink that also appends every event to `journal`.
    ///
    /// The returned writer finishes once every clone of the sink is dropped
    /// and the backlog has been written.
    pub fn with_journal(journal: Journal) -> (Self, JoinHandle<()>) {
        let (journal_tx, journal_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_journal(journal, journal_rx));
        let mut sink = Self::new();
        sink.journal = Some(journal_tx);
        (sink, writer)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        let record = EventRecord {
            at: Utc::now(),
            event,
        };
        log_event(&record.event);
        if let Some(journal) = &self.journal {
            if journal.send(record.clone()).is_err() {
                tracing::warn!("journal writer stopped, event not recorded");
            }
        }
        let _ = self.tx.send(record);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Append queued records in batches on the blocking pool.
async fn write_journal(mut journal: Journal, mut rx: mpsc::UnboundedReceiver<EventRecord>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        let written = tokio::task::spawn_blocking(move || {
            let result = batch.iter().try_for_each(|record| journal.append(record));
            (journal, result)
        })
        .await;
        match written {
            Ok((back, result)) => {
                if let Err(err) = result {
                    tracing::warn!(path = %back.path().display(), error = %err, "journal append failed");
                }
                journal = back;
            }
            Err(err) => {
                tracing::error!(error = %err, "journal writer panicked");
                return;
            }
        }
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::TaskFailed {
            key,
            kind,
            failure,
            reason,
        } => tracing::warn!(key = %key, kind = %kind, failure = ?failure, reason = %reason, "task failed"),
        SyncEvent::WatcherFailed { reason } => tracing::error!(reason = %reason, "watcher stopped"),
        SyncEvent::MonitorDiagnostic { message } => tracing::warn!(message = %message, "device monitor"),
        SyncEvent::TaskQueued { .. } | SyncEvent::TaskRequeued { .. } => {
            tracing::debug!(event = ?event, "queue")
        }
        other => tracing::info!(event = ?other, "status"),
    }
}
