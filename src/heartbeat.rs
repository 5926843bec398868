//! Liveness tracking for long-lived background tasks.
//!
//! Every supervised task (serial readers, log worker, input poller) holds a
//! [`BeatHandle`] and calls `beat()` from its loop at least every 250 ms.
//! The coordinator checks the registry once a second; a task whose last
//! beat is older than the stall threshold is reported as a `ThreadStall`
//! fault and, when restartable, respawned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A beat older than this is a stall.
pub const STALL_AFTER: Duration = Duration::from_secs(3);

struct TaskEntry {
    name: &'static str,
    last_ns: Arc<AtomicU64>,
    restartable: bool,
}

/// Registry of supervised tasks, owned by the coordinator.
pub struct HeartbeatRegistry {
    epoch: Instant,
    tasks: Mutex<Vec<TaskEntry>>,
}

/// A stalled task, as reported by [`HeartbeatRegistry::stalled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    pub name: &'static str,
    pub restartable: bool,
}

impl Default for HeartbeatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a task (or re-register after a restart; the old entry is
    /// replaced). The returned handle is cheap to clone into the task.
    pub fn register(&self, name: &'static str, restartable: bool) -> BeatHandle {
        let cell = Arc::new(AtomicU64::new(self.now_ns()));
        let mut tasks = self.tasks.lock().expect("heartbeat registry poisoned");
        tasks.retain(|t| t.name != name);
        tasks.push(TaskEntry {
            name,
            last_ns: cell.clone(),
            restartable,
        });
        BeatHandle {
            epoch: self.epoch,
            cell,
        }
    }

    pub fn unregister(&self, name: &'static str) {
        let mut tasks = self.tasks.lock().expect("heartbeat registry poisoned");
        tasks.retain(|t| t.name != name);
    }

    /// Tasks whose last beat is older than [`STALL_AFTER`].
    pub fn stalled(&self) -> Vec<Stall> {
        let now = self.now_ns();
        let threshold = STALL_AFTER.as_nanos() as u64;
        let tasks = self.tasks.lock().expect("heartbeat registry poisoned");
        tasks
            .iter()
            .filter(|t| now.saturating_sub(t.last_ns.load(Ordering::Relaxed)) > threshold)
            .map(|t| Stall {
                name: t.name,
                restartable: t.restartable,
            })
            .collect()
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Per-task handle publishing liveness timestamps.
#[derive(Clone)]
pub struct BeatHandle {
    epoch: Instant,
    cell: Arc<AtomicU64>,
}

impl BeatHandle {
    pub fn beat(&self) {
        self.cell
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}
