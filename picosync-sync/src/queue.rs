//! The coalescing, single-flight sync queue.
//!
//! Pending tasks are keyed by [`TaskKey`]; at most one task per key is ever
//! pending. A new task for a pending key replaces it and moves to the back
//! (last writer wins). Dispatch hands out one task at a time and refuses to
//! hand out another until [`SyncQueue::complete`] is called.
//!
//! ```text
//!   Idle ──dispatch (connected, non-empty)──▶ Draining
//!    ▲                                            │
//!    └──── empty / disconnected / interrupted ────┘
//! ```

use std::collections::{BTreeMap, HashMap};

use picosync_core::{DeviceState, SyncTask, TaskKey, TaskKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Idle,
    Draining,
}

/// What [`SyncQueue::enqueue`] did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// A pending task for the same key was replaced.
    Replaced { previous: TaskKind },
}

#[derive(Debug)]
pub struct SyncQueue {
    pending: BTreeMap<i64, SyncTask>,
    index: HashMap<TaskKey, i64>,
    next_back: i64,
    next_front: i64,
    state: QueueState,
    in_flight: Option<SyncTask>,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncQueue {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            index: HashMap::new(),
            next_back: 0,
            next_front: -1,
            state: QueueState::Idle,
            in_flight: None,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Number of pending tasks (the in-flight one excluded).
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight(&self) -> Option<&SyncTask> {
        self.in_flight.as_ref()
    }

    /// Pending tasks in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncTask> {
        self.pending.values()
    }

    pub fn get(&self, key: &TaskKey) -> Option<&SyncTask> {
        self.index.get(key).and_then(|seq| self.pending.get(seq))
    }

    /// Admit `task` at the back of the queue, coalescing with any pending
    /// task for the same key. A Delete also drops pending tasks beneath its
    /// key, since removing a directory removes them on the device anyway.
    pub fn enqueue(&mut self, task: SyncTask) -> Admission {
        let previous = self.take(&task.key).map(|t| t.kind);

        if task.kind == TaskKind::Delete {
            let pruned = self.prune_inside(&task.key);
            if pruned > 0 {
                tracing::debug!("delete of {} pruned {pruned} pending task(s)", task.key);
            }
        }

        let seq = self.next_back;
        self.next_back += 1;
        self.insert(seq, task);

        match previous {
            Some(previous) => Admission::Replaced { previous },
            None => Admission::Added,
        }
    }

    /// Put an interrupted task back at the front.
    ///
    /// Returns `false` (and drops `task`) when a newer task for the same key
    /// was enqueued meanwhile; the newer one already describes the latest
    /// state of the file.
    pub fn requeue_front(&mut self, task: SyncTask) -> bool {
        if self.index.contains_key(&task.key) {
            return false;
        }
        let seq = self.next_front;
        self.next_front -= 1;
        self.insert(seq, task);
        true
    }

    /// Hand out the next task if the device is connected and nothing is in
    /// flight.
    pub fn dispatch(&mut self, device: &DeviceState) -> Option<SyncTask> {
        if self.in_flight.is_some() {
            return None;
        }
        if !device.connected {
            self.state = QueueState::Idle;
            return None;
        }
        let Some((_, task)) = self.pending.pop_first() else {
            self.state = QueueState::Idle;
            return None;
        };
        self.index.remove(&task.key);
        self.state = QueueState::Draining;
        self.in_flight = Some(task.clone());
        Some(task)
    }

    /// Mark the in-flight task finished (succeeded or failed terminally).
    pub fn complete(&mut self) -> Option<SyncTask> {
        self.in_flight.take()
    }

    /// Finish the in-flight task without success and put it back at the
    /// front; the queue pauses until the next dispatch.
    pub fn interrupt(&mut self) -> bool {
        self.state = QueueState::Idle;
        match self.in_flight.take() {
            Some(task) => self.requeue_front(task),
            None => false,
        }
    }

    /// Pause draining without touching pending tasks.
    pub fn pause(&mut self) {
        self.state = QueueState::Idle;
    }

    /// Discard every pending task; the in-flight one is left to finish.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.index.clear();
        self.state = QueueState::Idle;
        discarded
    }

    /// Lazily dispatch tasks while `device` stays connected.
    ///
    /// Pulling the next item completes the previous one. Dropping the
    /// iterator completes the last item; [`Drain::interrupt`] puts it back
    /// instead. A later `drain` resumes where this one stopped.
    pub fn drain(&mut self, device: &DeviceState) -> Drain<'_> {
        Drain {
            queue: self,
            device: device.clone(),
            halted: false,
        }
    }

    fn take(&mut self, key: &TaskKey) -> Option<SyncTask> {
        let seq = self.index.remove(key)?;
        self.pending.remove(&seq)
    }

    fn insert(&mut self, seq: i64, task: SyncTask) {
        let clash = self.index.insert(task.key.clone(), seq);
        debug_assert!(clash.is_none(), "two pending tasks for {}", task.key);
        self.pending.insert(seq, task);
    }

    fn prune_inside(&mut self, dir: &TaskKey) -> usize {
        let doomed: Vec<TaskKey> = self
            .index
            .keys()
            .filter(|key| key.is_inside(dir))
            .cloned()
            .collect();
        for key in &doomed {
            self.take(key);
        }
        doomed.len()
    }
}

/// Iterator returned by [`SyncQueue::drain`].
pub struct Drain<'a> {
    queue: &'a mut SyncQueue,
    device: DeviceState,
    halted: bool,
}

impl Drain<'_> {
    /// Stop draining and requeue the current task at the front (device lost
    /// mid-transfer).
    pub fn interrupt(&mut self) {
        self.queue.interrupt();
        self.halted = true;
    }
}

impl Iterator for Drain<'_> {
    type Item = SyncTask;

    fn next(&mut self) -> Option<SyncTask> {
        if self.halted {
            return None;
        }
        self.queue.complete();
        self.queue.dispatch(&self.device)
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        self.queue.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picosync_core::{PicoModel, TaskOrigin};
    use std::path::PathBuf;

    fn upload(key: &str) -> SyncTask {
        SyncTask::upload(key.into(), PathBuf::from("/p").join(key), TaskOrigin::Watcher)
    }

    fn delete(key: &str) -> SyncTask {
        SyncTask::delete(key.into(), PathBuf::from("/p").join(key), TaskOrigin::Watcher)
    }

    fn online() -> DeviceState {
        DeviceState::connected("/dev/ttyACM0", PicoModel::Pico)
    }

    fn keys(q: &SyncQueue) -> Vec<&str> {
        q.iter().map(|t| t.key.as_str()).collect()
    }

    #[test]
    fn replacement_moves_to_back() {
        let mut q = SyncQueue::new();
        assert_eq!(q.enqueue(upload("a.py")), Admission::Added);
        q.enqueue(upload("b.py"));
        assert_eq!(
            q.enqueue(delete("a.py")),
            Admission::Replaced {
                previous: TaskKind::Upload
            }
        );
        assert_eq!(keys(&q), vec!["b.py", "a.py"]);
        assert_eq!(q.get(&"a.py".into()).unwrap().kind, TaskKind::Delete);
    }

    #[test]
    fn dispatch_is_single_flight() {
        let mut q = SyncQueue::new();
        q.enqueue(upload("a.py"));
        q.enqueue(upload("b.py"));
        let first = q.dispatch(&online()).unwrap();
        assert_eq!(first.key.as_str(), "a.py");
        assert_eq!(q.state(), QueueState::Draining);
        assert!(q.dispatch(&online()).is_none(), "second dispatch while in flight");
        q.complete();
        assert_eq!(q.dispatch(&online()).unwrap().key.as_str(), "b.py");
    }

    #[test]
    fn disconnected_device_keeps_queue_idle() {
        let mut q = SyncQueue::new();
        q.enqueue(upload("a.py"));
        assert!(q.dispatch(&DeviceState::disconnected()).is_none());
        assert_eq!(q.state(), QueueState::Idle);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn interrupted_task_goes_back_to_front() {
        let mut q = SyncQueue::new();
        q.enqueue(upload("a.py"));
        q.enqueue(upload("b.py"));
        q.dispatch(&online());
        assert!(q.interrupt());
        assert_eq!(keys(&q), vec!["a.py", "b.py"]);
        assert!(q.in_flight().is_none());
    }

    #[test]
    fn requeue_skipped_when_newer_task_pending() {
        let mut q = SyncQueue::new();
        q.enqueue(upload("a.py"));
        let task = q.dispatch(&online()).unwrap();
        q.enqueue(delete("a.py"));
        q.complete();
        assert!(!q.requeue_front(task));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(&"a.py".into()).unwrap().kind, TaskKind::Delete);
    }

    #[test]
    fn directory_delete_prunes_children() {
        let mut q = SyncQueue::new();
        q.enqueue(upload("lib/a.py"));
        q.enqueue(upload("lib/sub/b.py"));
        q.enqueue(upload("library.py"));
        q.enqueue(delete("lib"));
        assert_eq!(keys(&q), vec!["library.py", "lib"]);
    }

    #[test]
    fn drain_is_lazy_and_restartable() {
        let mut q = SyncQueue::new();
        for key in ["a.py", "b.py", "c.py"] {
            q.enqueue(upload(key));
        }
        {
            let mut drain = q.drain(&online());
            assert_eq!(drain.next().unwrap().key.as_str(), "a.py");
            assert_eq!(drain.next().unwrap().key.as_str(), "b.py");
            drain.interrupt();
            assert!(drain.next().is_none());
        }
        assert_eq!(q.state(), QueueState::Idle);
        let rest: Vec<_> = q.drain(&online()).map(|t| t.key.0).collect();
        assert_eq!(rest, vec!["b.py", "c.py"]);
        assert!(q.is_empty());
        assert!(q.in_flight().is_none());
    }

    #[test]
    fn clear_leaves_in_flight_alone() {
        let mut q = SyncQueue::new();
        q.enqueue(upload("a.py"));
        q.enqueue(upload("b.py"));
        q.dispatch(&online());
        assert_eq!(q.clear(), 1);
        assert_eq!(q.in_flight().unwrap().key.as_str(), "a.py");
    }
}
