//! Coalescing and resumption properties of the sync queue, exercised through
//! the public API only.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use picosync_core::{DeviceState, PicoModel, SyncConfig, SyncTask, TaskKind, TaskOrigin};
use picosync_sync::{ChangeKind, Debouncer, PathFilter, QueueState, SyncQueue};
use tempfile::TempDir;

fn online() -> DeviceState {
    DeviceState::connected("/dev/ttyACM0", PicoModel::Pico2)
}

fn upload(key: &str) -> SyncTask {
    SyncTask::upload(key.into(), PathBuf::from("/p").join(key), TaskOrigin::Watcher)
}

#[test]
fn upload_then_delete_leaves_single_delete() {
    let mut queue = SyncQueue::new();
    queue.enqueue(upload("main.py"));
    queue.enqueue(SyncTask::delete(
        "main.py".into(),
        PathBuf::from("/p/main.py"),
        TaskOrigin::Watcher,
    ));
    let tasks: Vec<_> = queue.iter().collect();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::Delete);
}

#[test]
fn delete_then_upload_leaves_single_upload() {
    let mut queue = SyncQueue::new();
    queue.enqueue(SyncTask::delete(
        "main.py".into(),
        PathBuf::from("/p/main.py"),
        TaskOrigin::Watcher,
    ));
    queue.enqueue(upload("main.py"));
    let kinds: Vec<_> = queue.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TaskKind::Upload]);
}

#[test]
fn disconnect_mid_drain_preserves_remaining_tasks() {
    let mut queue = SyncQueue::new();
    for n in 0..7 {
        queue.enqueue(upload(&format!("mod{n}.py")));
    }
    // A later edit coalesces with a pending task before the drain starts.
    queue.enqueue(upload("mod3.py"));
    let before: Vec<String> = queue.iter().map(|t| t.key.0.clone()).collect();

    {
        let mut drain = queue.drain(&online());
        drain.next().expect("first task");
        // Second task is in flight when the board disappears.
        drain.next().expect("second task");
        drain.interrupt();
    }
    assert_eq!(queue.state(), QueueState::Idle);
    assert!(queue.dispatch(&DeviceState::disconnected()).is_none());

    let remaining: Vec<String> = queue.iter().map(|t| t.key.0.clone()).collect();
    assert_eq!(remaining.len(), 6);
    assert_eq!(remaining, before[1..].to_vec());

    // The interrupted one plus five untouched ones are re-drained in order.
    let redrained: Vec<String> = queue.drain(&online()).map(|t| t.key.0).collect();
    assert_eq!(redrained, before[1..].to_vec());
}

#[test]
fn rapid_modifies_become_one_task() {
    let dir = TempDir::new().unwrap();
    let filter = PathFilter::new(SyncConfig::new(dir.path())).unwrap();
    let path = filter.root().join("main.py");
    std::fs::write(&path, "x = 1\n").unwrap();

    let start = Instant::now();
    let mut debouncer = Debouncer::new(Duration::from_millis(400));
    for ms in (0..300).step_by(25) {
        debouncer.record(path.clone(), ChangeKind::Changed, start + Duration::from_millis(ms));
    }

    let mut queue = SyncQueue::new();
    for (path, _) in debouncer.take_due(start + Duration::from_secs(1)) {
        let key = filter.file_key(&path).expect("eligible");
        queue.enqueue(SyncTask::upload(key, path, TaskOrigin::Watcher));
    }

    let dispatched: Vec<_> = queue.drain(&online()).collect();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].key.as_str(), "main.py");
}

#[test]
fn flat_config_ignores_nested_changes() {
    let dir = TempDir::new().unwrap();
    let filter = PathFilter::new(
        SyncConfig::new(dir.path())
            .with_extensions([".py"])
            .with_subdirs(false),
    )
    .unwrap();
    let root = filter.root().to_path_buf();

    let mut queue = SyncQueue::new();
    for path in [root.join("lib").join("helper.py"), root.join("main.py")] {
        if let Some(key) = filter.file_key(&path) {
            queue.enqueue(SyncTask::upload(key, path, TaskOrigin::Watcher));
        }
    }
    let tasks: Vec<_> = queue.iter().collect();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].key.as_str(), "main.py");
    assert_eq!(tasks[0].kind, TaskKind::Upload);
}
