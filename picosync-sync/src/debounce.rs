//! Per-path burst coalescing for raw filesystem events.
//!
//! An editor save typically produces `create` + `modify` + `modify` within a
//! few milliseconds. Each path keeps only its latest change and is released
//! once no new event has arrived for the quiet window. A path that keeps
//! changing is still released after `max_hold`.
//!
//! Time is passed in by the caller so the daemon can drive it from the tokio
//! clock (and paused-time tests).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Latest observed change of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or modified; the current contents should be mirrored.
    Changed,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: ChangeKind,
    first_seen: Instant,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    max_hold: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_hold: window * 10,
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a raw event. A later event overrides the kind of an earlier one.
    pub fn record(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        self.pending
            .entry(path)
            .and_modify(|p| {
                p.kind = kind;
                p.last_seen = now;
            })
            .or_insert(Pending {
                kind,
                first_seen: now,
                last_seen: now,
            });
    }

    /// Remove and return every path whose quiet window has elapsed, oldest
    /// first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind)> {
        let (window, max_hold) = (self.window, self.max_hold);
        let mut due: Vec<(PathBuf, Pending)> = Vec::new();
        self.pending.retain(|path, p| {
            if is_due(p, window, max_hold, now) {
                due.push((path.clone(), *p));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(_, p)| p.first_seen);
        due.into_iter().map(|(path, p)| (path, p.kind)).collect()
    }

    /// Earliest instant at which [`take_due`](Self::take_due) will return
    /// something, or `None` when nothing is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| (p.last_seen + self.window).min(p.first_seen + self.max_hold))
            .min()
    }

    /// Drop everything pending (session stopped).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn is_due(p: &Pending, window: Duration, max_hold: Duration, now: Instant) -> bool {
    now >= p.last_seen + window || now >= p.first_seen + max_hold
}
