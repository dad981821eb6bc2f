//! Change watcher: a notify subscription on the sync root whose raw events
//! are debounced per path and turned into sync tasks.
//!
//! The task blocks on the notify channel, so nothing is polled. On a backend
//! error it re-subscribes once; a second consecutive error stops the watcher
//! and reports [`Input::WatcherFailed`].

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use picosync_core::{SyncTask, TaskKey, TaskOrigin};
use picosync_sync::{scan_dir, ChangeKind, Debouncer, PathFilter};

use crate::dispatcher::Input;
use crate::error::DaemonError;

type NotifyTx = mpsc::UnboundedSender<notify::Result<Event>>;

/// A running watcher. Dropping the handle stops it as well.
#[derive(Debug)]
pub struct WatcherHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

/// Subscribe to `filter`'s root and start forwarding debounced changes,
/// tagged with `generation`, to `out`.
pub fn spawn(
    filter: PathFilter,
    window: Duration,
    generation: u64,
    out: mpsc::Sender<Input>,
) -> Result<WatcherHandle, DaemonError> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let watcher = subscribe(&filter, event_tx.clone())?;
    let state = WatchState::new(filter, window);
    let (stop_tx, stop_rx) = oneshot::channel();
    let join = tokio::spawn(watch_loop(
        state, watcher, event_tx, event_rx, generation, out, stop_rx,
    ));
    Ok(WatcherHandle {
        stop: Some(stop_tx),
        join,
    })
}

fn subscribe(filter: &PathFilter, event_tx: NotifyTx) -> notify::Result<RecommendedWatcher> {
    let mut watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    let mode = if filter.config().include_subdirs {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(filter.root(), mode)?;
    tracing::debug!(root = %filter.root().display(), ?mode, "watching sync root");
    Ok(watcher)
}

async fn watch_loop(
    mut state: WatchState,
    mut watcher: RecommendedWatcher,
    event_tx: NotifyTx,
    mut event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    generation: u64,
    out: mpsc::Sender<Input>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut resubscribed = false;

    loop {
        let deadline = state.debouncer.next_deadline().map(Instant::from_std);
        tokio::select! {
            _ = &mut stop => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) => {
                        resubscribed = false;
                        if event.need_rescan() {
                            let tasks = state.rescan();
                            if !forward(&out, generation, tasks).await {
                                break;
                            }
                            continue;
                        }
                        state.record(&event, Instant::now().into_std());
                    }
                    Err(err) if !resubscribed => {
                        tracing::warn!(error = %err, "watcher error, re-subscribing");
                        drop(watcher);
                        match subscribe(&state.filter, event_tx.clone()) {
                            Ok(fresh) => {
                                watcher = fresh;
                                resubscribed = true;
                            }
                            Err(err) => {
                                fail(&out, generation, err).await;
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        fail(&out, generation, err).await;
                        break;
                    }
                }
            }
            _ = wait_for(deadline) => {
                let tasks = state.flush(Instant::now().into_std());
                if !forward(&out, generation, tasks).await {
                    break;
                }
            }
        }
    }

    drop(watcher);
    tracing::debug!(generation, "watcher stopped");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Returns `false` once the dispatcher is gone.
async fn forward(out: &mpsc::Sender<Input>, generation: u64, tasks: Vec<SyncTask>) -> bool {
    if tasks.is_empty() {
        return true;
    }
    out.send(Input::Changes { generation, tasks }).await.is_ok()
}

async fn fail(out: &mpsc::Sender<Input>, generation: u64, err: notify::Error) {
    let _ = out
        .send(Input::WatcherFailed {
            generation,
            reason: err.to_string(),
        })
        .await;
}

/// Debouncer plus what the watcher knows about local directories.
#[derive(Debug)]
pub(crate) struct WatchState {
    filter: PathFilter,
    debouncer: Debouncer,
    known_dirs: HashSet<TaskKey>,
}

impl WatchState {
    pub(crate) fn new(filter: PathFilter, window: Duration) -> Self {
        let known_dirs = collect_dir_keys(&filter, filter.root());
        Self {
            filter,
            debouncer: Debouncer::new(window),
            known_dirs,
        }
    }

    pub(crate) fn record(&mut self, event: &Event, now: std::time::Instant) {
        for (path, change) in changes_for(event) {
            if self.filter.key_for(&path).is_some() {
                self.debouncer.record(path, change, now);
            }
        }
    }

    /// Tasks for every path whose quiet window has elapsed.
    pub(crate) fn flush(&mut self, now: std::time::Instant) -> Vec<SyncTask> {
        let due = self.debouncer.take_due(now);
        let mut tasks = Vec::new();
        for (path, change) in due {
            tasks.extend(self.tasks_for(&path, change));
        }
        tasks
    }

    /// The backend dropped events; re-upload everything (unchanged content is
    /// skipped by the executor).
    fn rescan(&mut self) -> Vec<SyncTask> {
        tracing::warn!(root = %self.filter.root().display(), "watcher overflow, rescanning");
        self.debouncer.clear();
        self.known_dirs = collect_dir_keys(&self.filter, self.filter.root());
        match picosync_sync::scan_tree(&self.filter) {
            Ok(files) => files
                .into_iter()
                .map(|(key, path)| SyncTask::upload(key, path, TaskOrigin::Watcher))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "rescan failed");
                Vec::new()
            }
        }
    }

    fn tasks_for(&mut self, path: &Path, change: ChangeKind) -> Vec<SyncTask> {
        match change {
            ChangeKind::Changed if path.is_dir() => self.expand_dir(path),
            ChangeKind::Changed if path.is_file() => self
                .filter
                .file_key(path)
                .map(|key| vec![SyncTask::upload(key, path.to_path_buf(), TaskOrigin::Watcher)])
                .unwrap_or_default(),
            // Gone again before the window closed.
            ChangeKind::Changed | ChangeKind::Removed => self.removal(path),
        }
    }

    fn expand_dir(&mut self, dir: &Path) -> Vec<SyncTask> {
        if self.filter.dir_key(dir).is_none() {
            return Vec::new();
        }
        self.known_dirs.extend(collect_dir_keys(&self.filter, dir));
        match scan_dir(&self.filter, dir) {
            Ok(files) => files
                .into_iter()
                .map(|(key, path)| SyncTask::upload(key, path, TaskOrigin::Watcher))
                .collect(),
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "directory scan failed");
                Vec::new()
            }
        }
    }

    fn removal(&mut self, path: &Path) -> Vec<SyncTask> {
        let Some(key) = self.filter.key_for(path) else {
            return Vec::new();
        };
        if self.known_dirs.contains(&key) {
            self.known_dirs
                .retain(|dir| dir != &key && !dir.is_inside(&key));
            return vec![SyncTask::delete(key, path.to_path_buf(), TaskOrigin::Watcher)];
        }
        if self.filter.file_key(path).is_some() {
            return vec![SyncTask::delete(key, path.to_path_buf(), TaskOrigin::Watcher)];
        }
        Vec::new()
    }
}

/// Map one notify event to per-path changes.
pub(crate) fn changes_for(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
    let all = |change: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
        event.paths.iter().map(|p| (p.clone(), change)).collect()
    };
    match &event.kind {
        EventKind::Create(_) => all(ChangeKind::Changed),
        EventKind::Remove(_) => all(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ChangeKind::Changed),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            (event.paths[0].clone(), ChangeKind::Removed),
            (event.paths[1].clone(), ChangeKind::Changed),
        ],
        // Direction unknown: decide by whether the path still exists.
        EventKind::Modify(_) | EventKind::Any => event
            .paths
            .iter()
            .map(|p| {
                let change = if p.exists() {
                    ChangeKind::Changed
                } else {
                    ChangeKind::Removed
                };
                (p.clone(), change)
            })
            .collect(),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

/// Keys of `dir` (when eligible) and every eligible directory beneath it.
fn collect_dir_keys(filter: &PathFilter, dir: &Path) -> HashSet<TaskKey> {
    let mut keys = HashSet::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        if let Some(key) = filter.dir_key(&current) {
            keys.insert(key);
        }
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                tracing::debug!(path = %current.display(), error = %err, "cannot list directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && filter.dir_key(&path).is_some()
            {
                pending.push(path);
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use picosync_core::{SyncConfig, TaskKind};
    use std::time::Instant as StdInstant;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_millis(400);

    fn state(dir: &TempDir, subdirs: bool) -> WatchState {
        let filter =
            PathFilter::new(SyncConfig::new(dir.path()).with_subdirs(subdirs)).expect("filter");
        WatchState::new(filter, WINDOW)
    }

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(p.to_path_buf()))
    }

    fn summary(tasks: &[SyncTask]) -> Vec<(String, TaskKind)> {
        tasks.iter().map(|t| (t.key.0.clone(), t.kind)).collect()
    }

    #[test]
    fn editor_save_burst_yields_one_upload() {
        let dir = TempDir::new().unwrap();
        let mut s = state(&dir, true);
        let file = s.filter.root().join("main.py");
        fs::write(&file, "print(1)\n").unwrap();

        let t0 = StdInstant::now();
        s.record(&event(EventKind::Create(CreateKind::File), &[&file]), t0);
        s.record(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &[&file]),
            t0 + Duration::from_millis(5),
        );
        s.record(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &[&file]),
            t0 + Duration::from_millis(12),
        );
        assert!(s.flush(t0 + Duration::from_millis(100)).is_empty());
        let tasks = s.flush(t0 + Duration::from_secs(1));
        assert_eq!(summary(&tasks), vec![("main.py".to_string(), TaskKind::Upload)]);
    }

    #[test]
    fn nested_change_ignored_without_subdirs() {
        let dir = TempDir::new().unwrap();
        let mut s = state(&dir, false);
        let root = s.filter.root().to_path_buf();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/helper.py"), "").unwrap();
        fs::write(root.join("main.py"), "").unwrap();

        let t0 = StdInstant::now();
        let nested = root.join("lib/helper.py");
        let top = root.join("main.py");
        s.record(&event(EventKind::Create(CreateKind::File), &[&nested]), t0);
        s.record(&event(EventKind::Create(CreateKind::File), &[&top]), t0);
        let tasks = s.flush(t0 + Duration::from_secs(1));
        assert_eq!(summary(&tasks), vec![("main.py".to_string(), TaskKind::Upload)]);
    }

    #[test]
    fn new_directory_expands_to_contained_files() {
        let dir = TempDir::new().unwrap();
        let mut s = state(&dir, true);
        let root = s.filter.root().to_path_buf();
        fs::create_dir_all(root.join("drivers/sensors")).unwrap();
        fs::write(root.join("drivers/led.py"), "").unwrap();
        fs::write(root.join("drivers/sensors/bme.py"), "").unwrap();
        fs::write(root.join("drivers/readme.txt"), "").unwrap();

        let t0 = StdInstant::now();
        let drivers = root.join("drivers");
        s.record(&event(EventKind::Create(CreateKind::Folder), &[&drivers]), t0);
        let tasks = s.flush(t0 + Duration::from_secs(1));
        assert_eq!(
            summary(&tasks),
            vec![
                ("drivers/led.py".to_string(), TaskKind::Upload),
                ("drivers/sensors/bme.py".to_string(), TaskKind::Upload),
            ]
        );
        assert!(s.known_dirs.contains(&TaskKey::from("drivers/sensors")));
    }

    #[test]
    fn removed_directory_becomes_one_delete() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("lib/sub")).unwrap();
        let mut s = state(&dir, true);
        assert!(s.known_dirs.contains(&TaskKey::from("lib")));
        fs::remove_dir_all(root.join("lib")).unwrap();

        let t0 = StdInstant::now();
        let lib = root.join("lib");
        s.record(&event(EventKind::Remove(RemoveKind::Folder), &[&lib]), t0);
        let tasks = s.flush(t0 + Duration::from_secs(1));
        assert_eq!(summary(&tasks), vec![("lib".to_string(), TaskKind::Delete)]);
        assert!(s.known_dirs.is_empty());
    }

    #[test]
    fn rename_both_moves_the_file() {
        let dir = TempDir::new().unwrap();
        let mut s = state(&dir, true);
        let root = s.filter.root().to_path_buf();
        let old = root.join("old.py");
        let new = root.join("new.py");
        fs::write(&new, "").unwrap();

        let t0 = StdInstant::now();
        s.record(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[&old, &new],
            ),
            t0,
        );
        let mut tasks = summary(&s.flush(t0 + Duration::from_secs(1)));
        tasks.sort();
        assert_eq!(
            tasks,
            vec![
                ("new.py".to_string(), TaskKind::Upload),
                ("old.py".to_string(), TaskKind::Delete),
            ]
        );
    }

    #[test]
    fn removed_foreign_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut s = state(&dir, true);
        let notes = s.filter.root().join("notes.txt");
        let t0 = StdInstant::now();
        s.record(&event(EventKind::Remove(RemoveKind::File), &[&notes]), t0);
        assert!(s.flush(t0 + Duration::from_secs(1)).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_watcher_forwards_debounced_upload() {
        let dir = TempDir::new().unwrap();
        let filter = PathFilter::new(SyncConfig::new(dir.path())).expect("filter");
        let root = filter.root().to_path_buf();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(filter, Duration::from_millis(50), 7, tx).expect("spawn");

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(root.join("main.py"), "print('hi')\n").unwrap();

        let input = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher forwarded nothing")
            .expect("channel open");
        match input {
            Input::Changes { generation, tasks } => {
                assert_eq!(generation, 7);
                assert_eq!(tasks[0].key.as_str(), "main.py");
                assert_eq!(tasks[0].kind, TaskKind::Upload);
            }
            _ => panic!("expected changes"),
        }
        handle.stop();
    }
}
