//! Deduplicating fault aggregator.
//!
//! Any task may call [`ErrorMonitor::notify`]; the coordinator drains the
//! escalation queue from its own loop each tick. The registered escalation
//! handler therefore only ever runs on the supervisor's thread; a
//! reporting thread never executes supervisor code.
//!
//! A fault is *new* when no fault with the same `(kind, message)` was seen
//! within the last second. Duplicates inside the window are counted but not
//! re-queued, so a flapping serial line cannot spam the coordinator. The
//! dedup table is bounded at 64 entries with least-recently-seen eviction.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::data::{self, Consumer, OverflowPolicy, Producer};
use crate::error::{Fault, FaultKind, Msg};

/// Sliding dedup window.
const DEDUP_WINDOW: Duration = Duration::from_secs(1);
/// Bounded dedup table size.
const DEDUP_CAP: usize = 64;
/// Escalation queue capacity.
const QUEUE_CAP: usize = 64;

/// Handler invoked for each drained fault, on the draining (supervisor)
/// thread.
pub type EscalationHandler = Box<dyn Fn(&Fault) + Send>;

struct DedupEntry {
    kind: FaultKind,
    message: Msg,
    last_seen: Instant,
    suppressed: u64,
}

struct DedupTable {
    entries: Vec<DedupEntry>,
    suppressed_total: u64,
}

impl DedupTable {
    /// Returns `true` when the fault is new within the window.
    fn admit(&mut self, fault: &Fault) -> bool {
        let now = fault.at;
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.kind == fault.kind && e.message == fault.message)
        {
            let fresh = now.duration_since(entry.last_seen) >= DEDUP_WINDOW;
            entry.last_seen = now;
            if !fresh {
                entry.suppressed += 1;
                self.suppressed_total += 1;
            }
            return fresh;
        }
        if self.entries.len() >= DEDUP_CAP {
            // Evict the least recently seen entry.
            if let Some(idx) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(idx);
            }
        }
        self.entries.push(DedupEntry {
            kind: fault.kind,
            message: fault.message.clone(),
            last_seen: now,
            suppressed: 0,
        });
        true
    }
}

/// Central fault aggregator with a supervisor-drained escalation queue.
pub struct ErrorMonitor {
    dedup: Mutex<DedupTable>,
    queue_tx: Mutex<Producer<Fault>>,
    queue_rx: Mutex<Consumer<Fault>>,
    escalation: Mutex<Option<EscalationHandler>>,
    signal: Notify,
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorMonitor {
    pub fn new() -> Self {
        let (tx, rx) = data::channel(QUEUE_CAP, OverflowPolicy::DropNewest);
        Self {
            dedup: Mutex::new(DedupTable {
                entries: Vec::with_capacity(DEDUP_CAP),
                suppressed_total: 0,
            }),
            queue_tx: Mutex::new(tx),
            queue_rx: Mutex::new(rx),
            escalation: Mutex::new(None),
            signal: Notify::new(),
        }
    }

    /// Register the handler the supervisor wants run for each drained fault.
    pub fn register_escalation(&self, handler: EscalationHandler) {
        *self.escalation.lock().expect("escalation lock poisoned") = Some(handler);
    }

    /// Report a fault. Duplicates within the window are counted and
    /// dropped; new faults are queued for the supervisor. Never blocks on
    /// I/O and never calls back into the reporter.
    pub fn notify(&self, fault: Fault) {
        let admit = {
            let mut dedup = self.dedup.lock().expect("dedup lock poisoned");
            dedup.admit(&fault)
        };
        if !admit {
            return;
        }
        tracing::warn!(kind = %fault.kind, origin = fault.origin, message = %fault.message, "fault reported");
        {
            let mut tx = self.queue_tx.lock().expect("fault queue poisoned");
            // DropNewest: the ring's dropped counter records any overflow.
            let _ = tx.try_push(fault);
        }
        self.signal.notify_one();
    }

    /// Drain every queued fault, invoking the escalation handler for each.
    /// Must only be called from the supervisor's loop.
    pub fn drain(&self) -> Vec<Fault> {
        let mut drained = Vec::new();
        {
            let mut rx = self.queue_rx.lock().expect("fault queue poisoned");
            while let Some(fault) = rx.try_pop() {
                drained.push(fault);
            }
        }
        if !drained.is_empty() {
            let handler = self.escalation.lock().expect("escalation lock poisoned");
            if let Some(handler) = handler.as_ref() {
                for fault in &drained {
                    handler(fault);
                }
            }
        }
        drained
    }

    /// Resolves when at least one fault has been queued since the last
    /// drain. The coordinator races this against its tick timer.
    pub async fn notified(&self) {
        self.signal.notified().await;
    }

    /// Escalations lost to a full queue.
    pub fn dropped_escalations(&self) -> u64 {
        self.queue_tx.lock().expect("fault queue poisoned").dropped()
    }

    /// Duplicates absorbed by the dedup window since startup.
    pub fn suppressed_total(&self) -> u64 {
        self.dedup.lock().expect("dedup lock poisoned").suppressed_total
    }
}
