//! The single consumer of everything that leads to a device call.
//!
//! The device monitor, the watcher, and socket clients post [`Input`]s onto
//! one channel. The dispatcher owns the [`SyncQueue`] and the
//! [`TransferExecutor`]; it moves the executor into `spawn_blocking` for each
//! device operation and gets it back with the result, so a second operation
//! cannot start before the first has finished.
//!
//! Control operations (identify, reset, wipe, remote listing and removal) go
//! through the same slot and run ahead of the next queued transfer.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use picosync_core::{
    DeviceState, PicoModel, Settings, SyncTask, TaskKey, TaskKind, TaskOrigin,
};
use picosync_device::bootsel::BootselVolume;
use picosync_device::{DeviceTool, PollReport, Transition};
use picosync_sync::{
    resync_tasks, RetryPolicy, SyncQueue, TransferError, TransferExecutor, TransferOutcome,
};

use crate::error::DaemonError;
use crate::events::{EventSink, FailureKind, SyncEvent};
use crate::session::SyncSession;

pub type Reply = oneshot::Sender<Result<Value, String>>;

/// Everything the dispatcher reacts to.
#[derive(Debug)]
pub enum Input {
    /// One device-monitor poll, transition or not.
    Poll(PollReport),
    /// BOOTSEL volume appeared (`Some`) or went away (`None`).
    Bootsel(Option<BootselVolume>),
    /// Debounced watcher output of session `generation`.
    Changes {
        generation: u64,
        tasks: Vec<SyncTask>,
    },
    WatcherFailed {
        generation: u64,
        reason: String,
    },
    Control(Control, Reply),
}

/// Requests from socket clients.
#[derive(Debug)]
pub enum Control {
    Status,
    /// Full-tree upload of the sync root.
    Sync,
    Reset,
    Wipe,
    /// Remote listing; `None` or empty lists the device root.
    List(Option<String>),
    /// Queue one local file under the sync root for upload.
    Upload(PathBuf),
    /// Remove a file or directory on the device, relative to its root.
    Remove(String),
    /// Switch to new settings, restarting the session if it changed.
    Reconfigure(Box<Settings>),
}

#[derive(Debug)]
enum DeviceOp {
    /// Read the machine string to tell RP2040 from RP2350.
    Identify,
    Reset,
    Wipe,
    List(Option<TaskKey>),
    Remove(TaskKey),
}

#[derive(Debug)]
struct PendingOp {
    op: DeviceOp,
    reply: Option<Reply>,
}

enum Job {
    Transfer(SyncTask),
    Op(PendingOp),
}

enum Finished {
    Transfer {
        task: SyncTask,
        result: Result<TransferOutcome, TransferError>,
    },
    Op {
        op: DeviceOp,
        reply: Option<Reply>,
        result: Result<Value, TransferError>,
    },
}

type InFlight = JoinHandle<(TransferExecutor, Finished)>;

/// A task that failed terminally; listed until re-enqueued or resynced.
#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub key: TaskKey,
    pub kind: TaskKind,
    pub failure: FailureKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct LastResult {
    key: TaskKey,
    kind: TaskKind,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ResyncProgress {
    remaining: HashSet<TaskKey>,
    failed: usize,
}

pub struct Dispatcher {
    settings: Settings,
    tool: Arc<dyn DeviceTool>,
    events: EventSink,
    inputs: mpsc::Sender<Input>,
    watch: bool,
    session: Option<SyncSession>,
    generation: u64,
    queue: SyncQueue,
    device: DeviceState,
    /// Last transfer reported the device unavailable; wait for the next poll.
    suspect: bool,
    diagnostic: Option<String>,
    bootsel: Option<BootselVolume>,
    executor: Option<TransferExecutor>,
    in_flight: Option<InFlight>,
    forget_on_return: bool,
    discard_in_flight: bool,
    ops: VecDeque<PendingOp>,
    failed: BTreeMap<TaskKey, FailedTask>,
    resync: Option<ResyncProgress>,
    last_result: Option<LastResult>,
    started_at: DateTime<Utc>,
}

impl Dispatcher {
    /// `inputs` is the sending side of the channel later passed to
    /// [`run`](Self::run); watchers post their changes through it.
    pub fn new(
        settings: Settings,
        tool: Arc<dyn DeviceTool>,
        events: EventSink,
        inputs: mpsc::Sender<Input>,
    ) -> Self {
        let executor = TransferExecutor::new(tool.clone(), RetryPolicy::from_settings(&settings.engine));
        Self {
            settings,
            tool,
            events,
            inputs,
            watch: true,
            session: None,
            generation: 0,
            queue: SyncQueue::new(),
            device: DeviceState::disconnected(),
            suspect: false,
            diagnostic: None,
            bootsel: None,
            executor: Some(executor),
            in_flight: None,
            forget_on_return: false,
            discard_in_flight: false,
            ops: VecDeque::new(),
            failed: BTreeMap::new(),
            resync: None,
            last_result: None,
            started_at: Utc::now(),
        }
    }

    /// Run sessions without a filesystem watcher (changes arrive only as
    /// [`Input::Changes`] posted by the caller).
    pub fn without_watcher(mut self) -> Self {
        self.watch = false;
        self
    }

    /// Start the first session. Fails on an invalid configuration.
    pub fn open(&mut self) -> Result<(), DaemonError> {
        self.generation += 1;
        self.session = SyncSession::open(&self.settings, self.generation, self.watch, &self.inputs)?;
        self.announce_session();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<crate::events::EventRecord> {
        self.events.subscribe()
    }

    /// Consume inputs until shutdown. An in-flight device call is awaited,
    /// never aborted.
    pub async fn run(
        mut self,
        mut inputs: mpsc::Receiver<Input>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        loop {
            self.pump();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                joined = join_in_flight(&mut self.in_flight) => self.finish(joined),
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    self.handle(input);
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.stop();
        }
        if let Some(handle) = self.in_flight.take() {
            tracing::info!("waiting for in-flight device operation before exit");
            let joined = handle.await;
            self.finish(joined);
        }
        Ok(())
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Poll(report) => self.on_poll(report),
            Input::Bootsel(volume) => self.on_bootsel(volume),
            Input::Changes { generation, tasks } => {
                if self.current_generation() != Some(generation) {
                    tracing::debug!(generation, "dropping changes of a stopped session");
                    return;
                }
                for task in tasks {
                    self.enqueue(task);
                }
            }
            Input::WatcherFailed { generation, reason } => {
                if self.current_generation() != Some(generation) {
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.watcher_failed();
                }
                self.events.emit(SyncEvent::WatcherFailed { reason });
            }
            Input::Control(control, reply) => self.on_control(control, reply),
        }
    }

    fn on_poll(&mut self, report: PollReport) {
        self.suspect = false;
        if report.diagnostic != self.diagnostic {
            if let Some(message) = &report.diagnostic {
                self.events.emit(SyncEvent::MonitorDiagnostic {
                    message: message.clone(),
                });
            }
            self.diagnostic = report.diagnostic;
        }
        match report.transition {
            Some(Transition::Connected(state)) => self.on_connected(state),
            Some(Transition::Disconnected) => self.on_disconnected(),
            None => {}
        }
    }

    fn on_connected(&mut self, state: DeviceState) {
        let port = state.port_id.clone().unwrap_or_default();
        self.device = state;
        match self.executor.as_mut() {
            Some(executor) => executor.forget_connection(),
            None => self.forget_on_return = true,
        }
        self.events.emit(SyncEvent::DeviceConnected {
            port,
            model: self.device.model,
        });

        if self.device.model == PicoModel::Unknown {
            self.ops.push_front(PendingOp {
                op: DeviceOp::Identify,
                reply: None,
            });
        }
        if self.session.as_ref().is_some_and(SyncSession::auto_sync) {
            if let Err(err) = self.start_resync(TaskOrigin::Resync) {
                tracing::warn!(error = %err, "resync on connect failed");
            }
        }
    }

    fn on_disconnected(&mut self) {
        let port = self.device.port_id.take();
        self.device = DeviceState::disconnected();
        self.queue.pause();
        for pending in self.ops.drain(..) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err("device disconnected".to_string()));
            }
        }
        self.events.emit(SyncEvent::DeviceDisconnected { port });
    }

    fn on_bootsel(&mut self, volume: Option<BootselVolume>) {
        if volume == self.bootsel {
            return;
        }
        match &volume {
            Some(vol) => self.events.emit(SyncEvent::BootselDetected {
                path: vol.path.clone(),
                model: vol.model,
            }),
            None => self.events.emit(SyncEvent::BootselCleared),
        }
        self.bootsel = volume;
    }

    fn on_control(&mut self, control: Control, reply: Reply) {
        let op = match control {
            Control::Status => {
                let _ = reply.send(Ok(self.status()));
                return;
            }
            Control::Sync => {
                let result = self
                    .start_resync(TaskOrigin::Manual)
                    .map(|files| json!({ "queued": files }));
                let _ = reply.send(result);
                return;
            }
            Control::Reconfigure(settings) => {
                let _ = reply.send(self.reconfigure(*settings));
                return;
            }
            Control::Upload(path) => {
                let _ = reply.send(self.push(&path));
                return;
            }
            Control::Reset => DeviceOp::Reset,
            Control::Wipe => DeviceOp::Wipe,
            Control::List(dir) => match remote_dir(dir.as_deref()) {
                Ok(dir) => DeviceOp::List(dir),
                Err(err) => {
                    let _ = reply.send(Err(err));
                    return;
                }
            },
            Control::Remove(target) => match remote_dir(Some(&target)) {
                Ok(Some(key)) => DeviceOp::Remove(key),
                Ok(None) => {
                    let _ = reply.send(Err("refusing to remove the device root; use wipe".to_string()));
                    return;
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                    return;
                }
            },
        };
        if !self.device.connected {
            let _ = reply.send(Err("device not connected".to_string()));
            return;
        }
        self.ops.push_back(PendingOp {
            op,
            reply: Some(reply),
        });
    }

    /// Admit a task; a re-enqueued path leaves the failed list.
    fn enqueue(&mut self, task: SyncTask) {
        self.failed.remove(&task.key);
        if task.kind == TaskKind::Delete {
            if let Some(resync) = self.resync.as_mut() {
                resync.remaining.retain(|key| !key.is_inside(&task.key));
            }
        }
        let (key, kind) = (task.key.clone(), task.kind);
        self.queue.enqueue(task);
        self.events.emit(SyncEvent::TaskQueued {
            key,
            kind,
            queue_len: self.queue.len(),
        });
        self.check_resync_done();
    }

    /// Queue a manual upload of one file, whatever the extension filter says.
    fn push(&mut self, path: &Path) -> Result<Value, String> {
        let Some(session) = self.session.as_ref() else {
            return Err("no sync root configured".to_string());
        };
        let key = TaskKey::under_root(session.filter().root(), path)
            .ok_or_else(|| format!("'{}' is outside the sync root", path.display()))?;
        if !path.is_file() {
            return Err(format!("'{}' is not a file", path.display()));
        }
        let local = session.filter().local_path(&key);
        self.enqueue(SyncTask::upload(key.clone(), local, TaskOrigin::Manual));
        Ok(json!({ "queued": key }))
    }

    /// Enqueue every eligible file. Keys that already have a pending task
    /// keep it: that task already reflects the latest local state.
    fn start_resync(&mut self, origin: TaskOrigin) -> Result<usize, String> {
        let Some(session) = self.session.as_ref() else {
            return Err("no sync root configured".to_string());
        };
        let tasks = resync_tasks(session.filter(), origin).map_err(|e| e.to_string())?;
        self.failed.clear();

        let mut remaining = HashSet::new();
        for task in tasks {
            remaining.insert(task.key.clone());
            if self.queue.get(&task.key).is_none() {
                self.queue.enqueue(task);
            }
        }
        let files = remaining.len();
        self.resync = Some(ResyncProgress {
            remaining,
            failed: 0,
        });
        self.events.emit(SyncEvent::ResyncStarted { origin, files });
        self.check_resync_done();
        Ok(files)
    }

    fn resync_progress(&mut self, key: &TaskKey, failed: bool) {
        if let Some(resync) = self.resync.as_mut() {
            if resync.remaining.remove(key) && failed {
                resync.failed += 1;
            }
        }
        self.check_resync_done();
    }

    fn check_resync_done(&mut self) {
        let done = self
            .resync
            .as_ref()
            .is_some_and(|r| r.remaining.is_empty());
        if !done {
            return;
        }
        let failed = self.resync.take().map(|r| r.failed).unwrap_or_default();
        self.events.emit(SyncEvent::ResyncCompleted { failed });
        if failed == 0 && self.settings.engine.reset_after_resync && self.device.connected {
            self.ops.push_back(PendingOp {
                op: DeviceOp::Reset,
                reply: None,
            });
        }
    }

    fn reconfigure(&mut self, settings: Settings) -> Result<Value, String> {
        let session_changed =
            settings.sync != self.settings.sync || settings.auto_sync != self.settings.auto_sync;
        if !session_changed {
            self.settings = settings;
            return Ok(json!({ "restarted": false }));
        }

        let generation = self.generation + 1;
        let next = SyncSession::open(&settings, generation, self.watch, &self.inputs)
            .map_err(|e| e.to_string())?;
        self.generation = generation;

        let discarded = self.queue.clear();
        self.resync = None;
        self.failed.clear();
        if self.queue.in_flight().is_some() {
            self.discard_in_flight = true;
        }
        if let Some(old) = self.session.take() {
            old.stop();
            self.events.emit(SyncEvent::SessionStopped { discarded });
        }

        self.session = next;
        self.settings = settings;
        self.announce_session();
        if self.device.connected && self.session.as_ref().is_some_and(SyncSession::auto_sync) {
            if let Err(err) = self.start_resync(TaskOrigin::Resync) {
                tracing::warn!(error = %err, "resync after reconfigure failed");
            }
        }
        Ok(json!({ "restarted": true, "discarded": discarded }))
    }

    fn announce_session(&self) {
        if let Some(session) = &self.session {
            self.events.emit(SyncEvent::SessionStarted {
                root: session.filter().root().to_path_buf(),
                watching: session.is_watching(),
            });
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.session.as_ref().map(SyncSession::generation)
    }

    fn active_port(&self) -> Option<String> {
        if !self.device.connected {
            return None;
        }
        self.settings
            .tool
            .port
            .clone()
            .or_else(|| self.device.port_id.clone())
    }

    /// Start the next device operation if the slot is free.
    fn pump(&mut self) {
        if self.in_flight.is_some() || self.executor.is_none() || self.suspect {
            return;
        }
        let Some(port) = self.active_port() else {
            self.queue.pause();
            return;
        };
        let job = if let Some(op) = self.ops.pop_front() {
            Job::Op(op)
        } else if let Some(task) = self.queue.dispatch(&self.device) {
            tracing::debug!(key = %task.key, kind = %task.kind, "dispatching");
            Job::Transfer(task)
        } else {
            return;
        };
        let Some(mut executor) = self.executor.take() else {
            return;
        };
        self.in_flight = Some(tokio::task::spawn_blocking(move || {
            let finished = run_job(&mut executor, job, &port);
            (executor, finished)
        }));
    }

    fn finish(&mut self, joined: Result<(TransferExecutor, Finished), JoinError>) {
        let (mut executor, finished) = match joined {
            Ok(done) => done,
            Err(err) => {
                tracing::error!(error = %err, "device operation panicked");
                self.queue.complete();
                self.executor = Some(TransferExecutor::new(
                    self.tool.clone(),
                    RetryPolicy::from_settings(&self.settings.engine),
                ));
                return;
            }
        };
        if std::mem::take(&mut self.forget_on_return) {
            executor.forget_connection();
        }
        self.executor = Some(executor);

        match finished {
            Finished::Transfer { task, result } => self.finish_transfer(task, result),
            Finished::Op { op, reply, result } => self.finish_op(op, reply, result),
        }
    }

    fn finish_transfer(&mut self, task: SyncTask, result: Result<TransferOutcome, TransferError>) {
        // A transfer of a stopped session says nothing about the current one.
        let discarded = std::mem::take(&mut self.discard_in_flight);
        let device_gone = !self.device.connected || self.suspect;
        let now = Utc::now();
        match result {
            Ok(outcome) => {
                self.queue.complete();
                self.last_result = Some(LastResult {
                    key: task.key.clone(),
                    kind: task.kind,
                    ok: true,
                    reason: None,
                    at: now,
                });
                self.events.emit(SyncEvent::TaskSucceeded {
                    key: task.key.clone(),
                    kind: task.kind,
                    attempts: outcome.attempts,
                    skipped: outcome.skipped,
                });
                if !discarded {
                    self.resync_progress(&task.key, false);
                }
            }
            Err(err)
                if !discarded
                    && (device_gone || matches!(err, TransferError::DeviceUnavailable { .. })) =>
            {
                tracing::warn!(key = %task.key, reason = %err.reason(), "device went away, task requeued");
                self.queue.interrupt();
                if matches!(err, TransferError::DeviceUnavailable { .. }) {
                    self.suspect = true;
                }
                self.events.emit(SyncEvent::TaskRequeued { key: task.key });
            }
            Err(err) => {
                self.queue.complete();
                let failure = failure_kind(&err);
                let reason = err.reason().to_string();
                self.last_result = Some(LastResult {
                    key: task.key.clone(),
                    kind: task.kind,
                    ok: false,
                    reason: Some(reason.clone()),
                    at: now,
                });
                if !discarded {
                    self.failed.insert(
                        task.key.clone(),
                        FailedTask {
                            key: task.key.clone(),
                            kind: task.kind,
                            failure,
                            reason: reason.clone(),
                            at: now,
                        },
                    );
                }
                self.events.emit(SyncEvent::TaskFailed {
                    key: task.key.clone(),
                    kind: task.kind,
                    failure,
                    reason,
                });
                if !discarded {
                    self.resync_progress(&task.key, true);
                }
            }
        }
    }

    fn finish_op(&mut self, op: DeviceOp, reply: Option<Reply>, result: Result<Value, TransferError>) {
        match (&op, &result) {
            (DeviceOp::Identify, Ok(Value::String(machine))) => {
                let model = PicoModel::from_chip_text(machine);
                if model != PicoModel::Unknown && self.device.connected {
                    self.device.model = model;
                }
                self.events.emit(SyncEvent::DeviceIdentified {
                    model,
                    machine: machine.clone(),
                });
            }
            (DeviceOp::Reset, Ok(_)) => self.events.emit(SyncEvent::DeviceReset),
            (DeviceOp::Wipe, Ok(_)) => self.events.emit(SyncEvent::DeviceWiped),
            (DeviceOp::Remove(key), Ok(_)) => {
                self.events.emit(SyncEvent::RemoteRemoved { key: key.clone() })
            }
            (_, Err(TransferError::DeviceUnavailable { .. })) => self.suspect = true,
            (_, Err(err)) => tracing::warn!(op = ?op, error = %err, "device operation failed"),
            _ => {}
        }
        if let Some(reply) = reply {
            let _ = reply.send(result.map_err(|e| e.to_string()));
        }
    }

    /// Snapshot for the `status` command.
    pub fn status(&self) -> Value {
        let session = self.session.as_ref().map(|s| {
            let config = s.filter().config();
            json!({
                "root": s.filter().root().display().to_string(),
                "extensions": config.include_extensions,
                "include_subdirs": config.include_subdirs,
                "auto_sync": s.auto_sync(),
                "watching": s.is_watching(),
            })
        });
        let pending: Vec<&str> = self.queue.iter().map(|t| t.key.as_str()).collect();
        let resync = self.resync.as_ref().map(|r| {
            json!({ "remaining": r.remaining.len(), "failed": r.failed })
        });
        let failed: Vec<&FailedTask> = self.failed.values().collect();

        json!({
            "running": true,
            "started_at": self.started_at,
            "device": self.device,
            "diagnostic": self.diagnostic,
            "bootsel": self.bootsel,
            "session": session,
            "queue": {
                "state": self.queue.state(),
                "pending": pending.len(),
                "tasks": pending,
                "in_flight": self.queue.in_flight().map(|t| t.key.as_str()),
            },
            "resync": resync,
            "failed": failed,
            "last_result": self.last_result,
        })
    }
}

async fn join_in_flight(
    slot: &mut Option<InFlight>,
) -> Result<(TransferExecutor, Finished), JoinError> {
    match slot {
        Some(handle) => {
            let joined = handle.await;
            *slot = None;
            joined
        }
        None => std::future::pending().await,
    }
}

fn run_job(executor: &mut TransferExecutor, job: Job, port: &str) -> Finished {
    match job {
        Job::Transfer(task) => {
            let result = executor.execute(&task, port);
            Finished::Transfer { task, result }
        }
        Job::Op(PendingOp { op, reply }) => {
            let result = match &op {
                DeviceOp::Identify => executor.machine(port).map(Value::String),
                DeviceOp::Reset => executor.reset_device(port).map(|()| json!({ "reset": true })),
                DeviceOp::Wipe => executor.wipe(port).map(|()| json!({ "wiped": true })),
                DeviceOp::Remove(key) => executor
                    .remove_remote(port, key)
                    .map(|()| json!({ "removed": key })),
                DeviceOp::List(dir) => executor.list_remote(port, dir.as_ref()).and_then(|entries| {
                    serde_json::to_value(entries).map_err(|e| TransferError::Permanent {
                        reason: e.to_string(),
                    })
                }),
            };
            Finished::Op { op, reply, result }
        }
    }
}

fn failure_kind(err: &TransferError) -> FailureKind {
    match err {
        TransferError::DeviceUnavailable { .. } => FailureKind::DeviceUnavailable,
        TransferError::Transient { .. } => FailureKind::Transient,
        TransferError::Permanent { .. } => FailureKind::Permanent,
    }
}

/// Parse a remote path argument; empty and `/` mean the device root.
fn remote_dir(dir: Option<&str>) -> Result<Option<TaskKey>, String> {
    let Some(dir) = dir.map(|d| d.trim().trim_matches('/')).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    TaskKey::from_relative(Path::new(dir))
        .map(Some)
        .ok_or_else(|| format!("invalid remote directory '{dir}'"))
}
