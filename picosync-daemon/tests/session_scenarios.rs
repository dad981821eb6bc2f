//! End-to-end dispatcher behaviour against a fake device tool.
//!
//! Inputs are injected directly (poll reports, watcher changes, controls);
//! the fake tool counts concurrent calls so overlapping device access fails
//! the test.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use picosync_core::{
    DeviceState, EngineSettings, PicoModel, Settings, SyncConfig, SyncTask, TaskKind, TaskOrigin,
};
use picosync_daemon::{
    Control, DaemonError, Dispatcher, EventRecord, EventSink, FailureKind, Input, SyncEvent,
};
use picosync_device::{DeviceListing, DeviceTool, PollReport, RemoteEntry, ToolError, Transition};

const PORT: &str = "/dev/ttyACM0";

#[derive(Default)]
struct FakeTool {
    calls: Mutex<Vec<String>>,
    /// Scripted failures per remote path (or per operation name for control calls).
    script: Mutex<HashMap<String, VecDeque<ToolError>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl FakeTool {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn fail(&self, target: &str, err: ToolError) {
        self.script
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_back(err);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn copies(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("cp ").map(str::to_string))
            .collect()
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn call(&self, label: String, target: &str) -> Result<(), ToolError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.calls.lock().unwrap().push(label);
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(VecDeque::pop_front);
        self.active.fetch_sub(1, Ordering::SeqCst);
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl DeviceTool for FakeTool {
    fn list_devices(&self) -> Result<Vec<DeviceListing>, ToolError> {
        Ok(Vec::new())
    }

    fn copy_file(&self, _port: &str, _local: &Path, remote: &str) -> Result<(), ToolError> {
        self.call(format!("cp {remote}"), remote)
    }

    fn remove_path(&self, _port: &str, remote: &str) -> Result<(), ToolError> {
        self.call(format!("rm {remote}"), remote)
    }

    fn make_dir(&self, _port: &str, remote: &str) -> Result<(), ToolError> {
        self.call(format!("mkdir {remote}"), remote)
    }

    fn reset(&self, _port: &str) -> Result<(), ToolError> {
        self.call("reset".into(), "reset")
    }

    fn list_dir(&self, _port: &str, remote: &str) -> Result<Vec<RemoteEntry>, ToolError> {
        self.call(format!("ls {remote}"), "ls")?;
        Ok(vec![RemoteEntry {
            name: "main.py".into(),
            size: Some(20),
            is_dir: false,
        }])
    }

    fn wipe(&self, _port: &str) -> Result<(), ToolError> {
        self.call("wipe".into(), "wipe")
    }

    fn machine(&self, _port: &str) -> Result<String, ToolError> {
        self.call("machine".into(), "machine")?;
        Ok("Raspberry Pi Pico 2 with RP2350".into())
    }
}

fn tool_failure(message: &str) -> ToolError {
    ToolError::Failed {
        operation: "cp",
        code: Some(1),
        message: message.into(),
    }
}

struct Harness {
    tool: Arc<FakeTool>,
    inputs: mpsc::Sender<Input>,
    events: broadcast::Receiver<EventRecord>,
    shutdown: broadcast::Sender<()>,
    run: JoinHandle<Result<(), DaemonError>>,
}

fn settings_for(root: &Path) -> Settings {
    Settings {
        sync: SyncConfig::new(root),
        auto_sync: true,
        engine: EngineSettings {
            retry_backoff_ms: 1,
            ..EngineSettings::default()
        },
        ..Settings::default()
    }
}

fn start(settings: Settings, tool: FakeTool) -> Harness {
    let tool = Arc::new(tool);
    let (tx, rx) = mpsc::channel(64);
    let (shutdown, _) = broadcast::channel(1);
    let mut dispatcher =
        Dispatcher::new(settings, tool.clone(), EventSink::new(), tx.clone()).without_watcher();
    dispatcher.open().unwrap();
    let events = dispatcher.subscribe();
    let run = tokio::spawn(dispatcher.run(rx, shutdown.subscribe()));
    Harness {
        tool,
        inputs: tx,
        events,
        shutdown,
        run,
    }
}

impl Harness {
    async fn connect(&self, model: PicoModel) {
        let state = DeviceState::connected(PORT, model);
        self.send(Input::Poll(PollReport {
            state: state.clone(),
            transition: Some(Transition::Connected(state)),
            diagnostic: None,
        }))
        .await;
    }

    async fn disconnect(&self) {
        self.send(Input::Poll(PollReport {
            state: DeviceState::disconnected(),
            transition: Some(Transition::Disconnected),
            diagnostic: None,
        }))
        .await;
    }

    async fn quiet_poll(&self) {
        self.send(Input::Poll(PollReport {
            state: DeviceState::connected(PORT, PicoModel::Pico),
            transition: None,
            diagnostic: None,
        }))
        .await;
    }

    async fn send(&self, input: Input) {
        self.inputs.send(input).await.unwrap();
    }

    async fn control(&self, control: Control) -> Result<Value, String> {
        let (tx, rx) = oneshot::channel();
        self.send(Input::Control(control, tx)).await;
        rx.await.unwrap()
    }

    /// Wait for the first event matching `pred`, collecting everything seen.
    async fn wait_for(&mut self, pred: impl Fn(&SyncEvent) -> bool) -> Vec<SyncEvent> {
        let mut seen = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = self.events.recv().await.unwrap();
                let hit = pred(&record.event);
                seen.push(record.event);
                if hit {
                    break;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "event not seen; got {seen:?}");
        seen
    }

    async fn stop(self) -> Arc<FakeTool> {
        let _ = self.shutdown.send(());
        self.run.await.unwrap().unwrap();
        self.tool
    }
}

fn project(files: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for file in files {
        let path = dir.path().join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, format!("# {file}\n")).unwrap();
    }
    dir
}

fn upload(root: &Path, rel: &str) -> SyncTask {
    let root = root.canonicalize().unwrap();
    SyncTask::upload(rel.into(), root.join(rel), TaskOrigin::Watcher)
}

fn is_resync_done(event: &SyncEvent) -> bool {
    matches!(event, SyncEvent::ResyncCompleted { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_triggers_one_resync_and_identifies_the_board() {
    let root = project(&["main.py", "lib/helper.py", "notes.txt"]);
    let mut h = start(settings_for(root.path()), FakeTool::default());

    h.connect(PicoModel::Unknown).await;
    let events = h.wait_for(is_resync_done).await;

    assert!(events.contains(&SyncEvent::ResyncStarted {
        origin: TaskOrigin::Resync,
        files: 2
    }));
    assert!(events.contains(&SyncEvent::DeviceIdentified {
        model: PicoModel::Pico2,
        machine: "Raspberry Pi Pico 2 with RP2350".into()
    }));
    assert_eq!(events.last(), Some(&SyncEvent::ResyncCompleted { failed: 0 }));

    // Quiet polls while connected never start another resync.
    h.quiet_poll().await;
    h.quiet_poll().await;
    let status = h.control(Control::Status).await.unwrap();
    assert_eq!(status["device"]["model"], "pico2");
    assert_eq!(status["queue"]["pending"], 0);

    let tool = h.stop().await;
    let calls = tool.calls();
    assert_eq!(calls[0], "machine", "identify runs before the first transfer");
    assert_eq!(tool.copies(), vec![":lib/helper.py", ":main.py"]);
    assert_eq!(calls.iter().filter(|c| c.starts_with("mkdir")).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_device_keeps_remaining_tasks_in_order() {
    let root = project(&["a.py", "b.py", "c.py"]);
    let tool = FakeTool::default();
    tool.fail(":b.py", tool_failure("mpremote: could not open port /dev/ttyACM0"));
    let mut h = start(settings_for(root.path()), tool);

    h.connect(PicoModel::Pico).await;
    h.wait_for(|e| matches!(e, SyncEvent::TaskRequeued { key } if key.as_str() == "b.py"))
        .await;

    h.disconnect().await;
    let status = h.control(Control::Status).await.unwrap();
    assert_eq!(status["queue"]["tasks"], serde_json::json!(["b.py", "c.py"]));
    assert_eq!(status["queue"]["state"], "idle");

    h.connect(PicoModel::Pico).await;
    h.wait_for(is_resync_done).await;

    let tool = h.stop().await;
    assert_eq!(
        tool.copies(),
        vec![":a.py", ":b.py", ":b.py", ":c.py", ":a.py"],
        "interrupted task resumes first, pending order kept"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_task_stays_listed_until_the_file_changes() {
    let root = project(&["good.py", "bad.py"]);
    let tool = FakeTool::default();
    for _ in 0..3 {
        tool.fail(":bad.py", tool_failure("could not enter raw repl"));
    }
    let mut h = start(settings_for(root.path()), tool);

    h.connect(PicoModel::Pico).await;
    let events = h.wait_for(is_resync_done).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::TaskFailed { key, kind: TaskKind::Upload, failure: FailureKind::Transient, reason }
            if key.as_str() == "bad.py" && reason.contains("could not enter raw repl")
    )));
    assert_eq!(events.last(), Some(&SyncEvent::ResyncCompleted { failed: 1 }));

    let status = h.control(Control::Status).await.unwrap();
    let failed = status["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["key"], "bad.py");
    assert_eq!(failed[0]["failure"], "transient");

    // The editor saves again: the path is re-enqueued and leaves the list.
    h.send(Input::Changes {
        generation: 1,
        tasks: vec![upload(root.path(), "bad.py")],
    })
    .await;
    let status = h.control(Control::Status).await.unwrap();
    assert!(status["failed"].as_array().unwrap().is_empty());
    h.wait_for(|e| matches!(e, SyncEvent::TaskSucceeded { key, .. } if key.as_str() == "bad.py"))
        .await;

    let tool = h.stop().await;
    assert_eq!(tool.copies().iter().filter(|c| *c == ":bad.py").count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_generation_changes_are_ignored() {
    let root = project(&["main.py"]);
    let mut settings = settings_for(root.path());
    settings.auto_sync = false;
    let h = start(settings, FakeTool::default());
    h.connect(PicoModel::Pico).await;

    h.send(Input::Changes {
        generation: 7,
        tasks: vec![upload(root.path(), "main.py")],
    })
    .await;
    let status = h.control(Control::Status).await.unwrap();
    assert_eq!(status["queue"]["pending"], 0);
    assert!(h.stop().await.copies().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn control_operations_never_overlap_transfers() {
    let names: Vec<String> = (0..6).map(|n| format!("m{n}.py")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let root = project(&refs);
    let mut h = start(
        settings_for(root.path()),
        FakeTool::with_delay(Duration::from_millis(15)),
    );

    h.connect(PicoModel::Pico).await;
    h.wait_for(|e| matches!(e, SyncEvent::TaskSucceeded { .. })).await;

    let (reset, wipe, list) = tokio::join!(
        h.control(Control::Reset),
        h.control(Control::Wipe),
        h.control(Control::List(Some("/".into()))),
    );
    assert!(reset.is_ok());
    assert!(wipe.is_ok());
    assert_eq!(list.unwrap()[0]["name"], "main.py");

    h.wait_for(is_resync_done).await;
    let tool = h.stop().await;
    assert_eq!(tool.max_active(), 1, "device calls overlapped");
    assert_eq!(tool.copies().len(), 6);
    let calls = tool.calls();
    assert!(calls.contains(&"reset".to_string()));
    assert!(calls.contains(&"wipe".to_string()));
    assert!(calls.contains(&"ls :".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_without_device_is_refused() {
    let root = project(&["main.py"]);
    let h = start(settings_for(root.path()), FakeTool::default());
    assert_eq!(
        h.control(Control::Reset).await,
        Err("device not connected".to_string())
    );
    assert!(h.control(Control::List(Some("../x".into()))).await.is_err());
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn switching_root_discards_queue_but_finishes_in_flight_transfer() {
    let names: Vec<String> = (0..5).map(|n| format!("old{n}.py")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let old_root = project(&refs);
    let new_root = project(&["fresh.py"]);
    let mut h = start(
        settings_for(old_root.path()),
        FakeTool::with_delay(Duration::from_millis(40)),
    );

    h.connect(PicoModel::Pico).await;
    h.wait_for(|e| matches!(e, SyncEvent::TaskSucceeded { .. })).await;

    let reply = h
        .control(Control::Reconfigure(Box::new(settings_for(new_root.path()))))
        .await
        .unwrap();
    assert_eq!(reply["restarted"], true);
    let discarded = reply["discarded"].as_u64().unwrap();
    assert!(discarded >= 1);

    let events = h
        .wait_for(|e| matches!(e, SyncEvent::TaskSucceeded { key, .. } if key.as_str() == "fresh.py"))
        .await;
    assert!(events.contains(&SyncEvent::SessionStopped {
        discarded: discarded as usize
    }));

    let status = h.control(Control::Status).await.unwrap();
    let canonical: PathBuf = new_root.path().canonicalize().unwrap();
    assert_eq!(status["session"]["root"], canonical.display().to_string());
    assert!(status["failed"].as_array().unwrap().is_empty());

    let tool = h.stop().await;
    let old_copies = tool.copies().iter().filter(|c| c.starts_with(":old")).count();
    assert_eq!(old_copies as u64 + discarded, 5, "discarded tasks never ran");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_mid_drain_keeps_every_remaining_task() {
    let root = project(&["a.py", "b.py", "c.py", "d.py", "e.py"]);
    let tool = FakeTool::with_delay(Duration::from_millis(150));
    // What mpremote prints once the port vanishes under it.
    for _ in 0..3 {
        tool.fail(
            ":a.py",
            tool_failure("mpremote: failed to access /dev/ttyACM0 (it may be in use by another program)"),
        );
    }
    let mut h = start(settings_for(root.path()), tool);

    h.connect(PicoModel::Pico).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.disconnect().await;
    let events = h
        .wait_for(|e| matches!(e, SyncEvent::TaskRequeued { key } if key.as_str() == "a.py"))
        .await;
    assert!(
        !events.iter().any(|e| matches!(e, SyncEvent::TaskFailed { .. })),
        "unplugging is not a task failure: {events:?}"
    );

    let status = h.control(Control::Status).await.unwrap();
    assert_eq!(
        status["queue"]["tasks"],
        serde_json::json!(["a.py", "b.py", "c.py", "d.py", "e.py"])
    );
    assert!(status["failed"].as_array().unwrap().is_empty());

    h.connect(PicoModel::Pico).await;
    h.wait_for(is_resync_done).await;

    let tool = h.stop().await;
    assert_eq!(
        tool.copies(),
        vec![":a.py", ":a.py", ":a.py", ":a.py", ":b.py", ":c.py", ":d.py", ":e.py"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn old_root_transfer_does_not_complete_new_resync() {
    let old_root = project(&["main.py", "x1.py", "x2.py"]);
    let new_root = project(&["a.py", "main.py"]);
    let with_reset = |root: &Path| {
        let mut settings = settings_for(root);
        settings.engine.reset_after_resync = true;
        settings
    };
    let mut h = start(
        with_reset(old_root.path()),
        FakeTool::with_delay(Duration::from_millis(100)),
    );

    // The old root's main.py is in flight when the root switches.
    h.connect(PicoModel::Pico).await;
    let reply = h
        .control(Control::Reconfigure(Box::new(with_reset(new_root.path()))))
        .await
        .unwrap();
    assert_eq!(reply["restarted"], true);

    let events = h.wait_for(|e| matches!(e, SyncEvent::DeviceReset)).await;
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SyncEvent::ResyncCompleted { .. }))
            .count(),
        1
    );

    let tool = h.stop().await;
    let calls = tool.calls();
    let main_copies: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| *c == "cp :main.py")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(main_copies.len(), 2, "calls: {calls:?}");
    let reset_at = calls.iter().position(|c| c == "reset").unwrap();
    assert!(
        reset_at > main_copies[1],
        "reset ran before the new main.py was uploaded: {calls:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_queues_one_file_and_rm_runs_on_the_device() {
    let root = project(&["main.py", "data.bin"]);
    let mut settings = settings_for(root.path());
    settings.auto_sync = false;
    let mut h = start(settings, FakeTool::default());
    let canonical = root.path().canonicalize().unwrap();

    // Removal needs the board; an upload waits for it.
    assert_eq!(
        h.control(Control::Remove("old.py".into())).await,
        Err("device not connected".to_string())
    );
    let reply = h
        .control(Control::Upload(canonical.join("data.bin")))
        .await
        .unwrap();
    assert_eq!(reply["queued"], "data.bin");
    let outside = h
        .control(Control::Upload(PathBuf::from("/etc/hosts")))
        .await
        .unwrap_err();
    assert!(outside.contains("outside the sync root"), "got: {outside}");
    let missing = h
        .control(Control::Upload(canonical.join("missing.py")))
        .await
        .unwrap_err();
    assert!(missing.contains("not a file"), "got: {missing}");

    h.connect(PicoModel::Pico).await;
    h.wait_for(|e| matches!(e, SyncEvent::TaskSucceeded { key, .. } if key.as_str() == "data.bin"))
        .await;

    let removed = h.control(Control::Remove("/lib/".into())).await.unwrap();
    assert_eq!(removed["removed"], "lib");
    assert!(h.control(Control::Remove("/".into())).await.is_err());
    h.wait_for(|e| matches!(e, SyncEvent::RemoteRemoved { key } if key.as_str() == "lib"))
        .await;

    let tool = h.stop().await;
    assert_eq!(tool.copies(), vec![":data.bin"]);
    assert!(tool.calls().contains(&"rm :lib".to_string()));
}
