//! Asynchronous CSV run logger.
//!
//! Producers call [`RunLogger::log`], which pushes onto a preallocated
//! 4096-event ring and never blocks or fails; a full ring drops the event
//! and counts it. A background worker drains the ring in batches, renders
//! each record to one CSV line, and flushes every 100 ms or 4 KiB of
//! buffered output, whichever comes first. Run files live under
//! `<root>/logs/` as `<RFC3339-timestamp>_<run_id>.csv`; a small
//! `manifest.json` beside them indexes completed runs.
//!
//! Line schema (one event per line, strings backslash-escaped so commas and
//! newlines never appear raw):
//!
//! ```text
//! <monotonic_ns>,<wall_utc_iso>,<run_id>,<state>,<kind>,<device>,<token>,<status>,<message>
//! ```
//!
//! On write or open failure the worker reports `StorageFull` /
//! `StorageMissing` once, keeps draining events to memory so producers
//! never stall, and periodically retries the file. On every flush the
//! storage quota is checked; the oldest completed run files are deleted
//! until usage is back under quota.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};

use crate::coordinator::SystemState;
use crate::data::{self, Consumer, OverflowPolicy, Producer};
use crate::error::{Fault, FaultKind, Msg};
use crate::heartbeat::HeartbeatRegistry;
use crate::monitor::ErrorMonitor;
use crate::parameter::Parameter;
use crate::rpc::{Device, Opcode, Status};

/// Default event ring capacity.
pub const EVENT_RING: usize = 4096;
/// Maximum events drained per worker iteration.
const DRAIN_BATCH: usize = 64;
/// Flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Flush threshold in buffered bytes.
const FLUSH_BYTES: usize = 4096;
/// Minimum spacing of synthetic dropped-count events.
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(1);
/// How often a failed file is retried.
const REOPEN_INTERVAL: Duration = Duration::from_secs(1);
/// Default storage quota.
pub const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;

const ENOSPC: i32 = 28;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process's monotonic epoch; the authoritative
/// ordering column of the log.
pub fn monotonic_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Opaque per-execution identifier, derived from wall-clock time at run
/// start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl RunId {
    pub fn generate() -> Self {
        Self(Utc::now().timestamp_millis() as u64)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of one run, as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted,
    Failed,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Tagged event record. Every variant is rendered to exactly one CSV line.
#[derive(Debug, Clone)]
pub enum LogEvent {
    StepEntered {
        protocol: Msg,
        step: Msg,
    },
    CommandSent {
        device: Device,
        token: u32,
        opcode: Opcode,
    },
    ResponseReceived {
        token: u32,
        status: Status,
        latency_us: u64,
    },
    ParameterChanged {
        key: Parameter,
        old: f64,
        new: f64,
    },
    Fault {
        kind: FaultKind,
        message: Msg,
    },
    HeartbeatMissed {
        task: &'static str,
    },
    RunStart {
        run_id: RunId,
    },
    RunEnd {
        run_id: RunId,
        outcome: RunOutcome,
    },
    /// Synthetic record making ring overflow visible in the trace.
    EventsDropped {
        count: u64,
    },
}

impl LogEvent {
    pub fn fault(fault: &Fault) -> Self {
        LogEvent::Fault {
            kind: fault.kind,
            message: fault.message.clone(),
        }
    }

    fn kind_label(&self) -> &'static str {
        match self {
            LogEvent::StepEntered { .. } => "step_entered",
            LogEvent::CommandSent { .. } => "command_sent",
            LogEvent::ResponseReceived { .. } => "response_received",
            LogEvent::ParameterChanged { .. } => "parameter_changed",
            LogEvent::Fault { .. } => "fault",
            LogEvent::HeartbeatMissed { .. } => "heartbeat_missed",
            LogEvent::RunStart { .. } => "run_start",
            LogEvent::RunEnd { .. } => "run_end",
            LogEvent::EventsDropped { .. } => "events_dropped",
        }
    }
}

/// One enqueued record: event plus emission context.
#[derive(Debug, Clone)]
struct Record {
    mono_ns: u64,
    wall: DateTime<Utc>,
    run_id: Option<RunId>,
    state: SystemState,
    event: LogEvent,
}

fn escape_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
}

fn render_line(record: &Record) -> String {
    use std::fmt::Write as _;

    let mut device = String::new();
    let mut token = String::new();
    let mut status = String::new();
    let mut message = String::new();

    match &record.event {
        LogEvent::StepEntered { protocol, step } => {
            escape_into(&mut message, &format!("{}/{}", protocol, step));
        }
        LogEvent::CommandSent {
            device: d,
            token: t,
            opcode,
        } => {
            device = d.label().to_string();
            token = t.to_string();
            message.push_str(opcode.mnemonic());
        }
        LogEvent::ResponseReceived {
            token: t,
            status: s,
            latency_us,
        } => {
            token = t.to_string();
            status = s.mnemonic().to_string();
            let _ = write!(message, "latency_us={}", latency_us);
        }
        LogEvent::ParameterChanged { key, old, new } => {
            escape_into(&mut message, &format!("{}={}->{}", key, old, new));
        }
        LogEvent::Fault { kind, message: m } => {
            let mut text = String::new();
            escape_into(&mut text, m);
            let _ = write!(message, "{}: {}", kind, text);
        }
        LogEvent::HeartbeatMissed { task } => {
            escape_into(&mut message, task);
        }
        LogEvent::RunStart { .. } => {}
        LogEvent::RunEnd { outcome, .. } => {
            message.push_str(outcome.label());
        }
        LogEvent::EventsDropped { count } => {
            let _ = write!(message, "{}", count);
        }
    }

    let run_id = match record.run_id {
        Some(id) => id.to_string(),
        None => String::new(),
    };

    format!(
        "{},{},{},{},{},{},{},{},{}\n",
        record.mono_ns,
        record.wall.to_rfc3339_opts(SecondsFormat::Micros, true),
        run_id,
        record.state,
        record.event.kind_label(),
        device,
        token,
        status,
        message
    )
}

const HEADER: &str = "monotonic_ns,wall_utc,run_id,state,kind,device,token,status,message\n";

/// Manifest entry for one completed run.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    run_id: u64,
    file: String,
    started: String,
    outcome: String,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Storage root; run files land in `<root>/logs/`.
    pub root: PathBuf,
    pub quota_bytes: u64,
    /// Event ring capacity (power of two).
    pub ring_capacity: usize,
}

impl LoggerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            ring_capacity: EVENT_RING,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

struct LoggerShared {
    tx: Mutex<Producer<Record>>,
    signal: Notify,
    state: AtomicU8,
    run_id: AtomicU64,
}

impl LoggerShared {
    fn current_state(&self) -> SystemState {
        SystemState::from_index(self.state.load(Ordering::Relaxed))
    }

    fn current_run(&self) -> Option<RunId> {
        match self.run_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(RunId(id)),
        }
    }
}

/// Cloneable producer handle. `log` never blocks and never fails.
#[derive(Clone)]
pub struct RunLogger {
    shared: Arc<LoggerShared>,
}

impl RunLogger {
    pub fn log(&self, event: LogEvent) {
        let record = Record {
            mono_ns: monotonic_ns(),
            wall: Utc::now(),
            run_id: self.shared.current_run(),
            state: self.shared.current_state(),
            event,
        };
        {
            let mut tx = self.shared.tx.lock().expect("log ring poisoned");
            // A full ring counts the drop; the worker reports it later.
            let _ = tx.try_push(record);
        }
        self.shared.signal.notify_one();
    }

    /// Record the coordinator state stamped onto subsequent events.
    pub fn set_state(&self, state: SystemState) {
        self.shared.state.store(state as u8, Ordering::Relaxed);
    }

    /// Events lost to ring overflow so far.
    pub fn dropped(&self) -> u64 {
        self.shared.tx.lock().expect("log ring poisoned").dropped()
    }
}

enum Control {
    StartRun(RunId),
    FinishRun(RunOutcome),
    Stop,
}

/// Owner-side handle: run lifecycle and shutdown.
pub struct LoggerHandle {
    shared: Arc<LoggerShared>,
    control: mpsc::UnboundedSender<Control>,
    worker: tokio::task::JoinHandle<()>,
}

impl LoggerHandle {
    /// Open the run file and write its header plus the `run_start` event.
    pub fn start_run(&self, run_id: RunId) {
        self.shared.run_id.store(run_id.0, Ordering::Relaxed);
        let _ = self.control.send(Control::StartRun(run_id));
    }

    /// Drain, write the terminating `run_end` event, and close the file.
    pub fn finish_run(&self, outcome: RunOutcome) {
        let _ = self.control.send(Control::FinishRun(outcome));
        self.shared.run_id.store(0, Ordering::Relaxed);
    }

    /// Drain the queue fully, flush, close, and join the worker.
    pub async fn stop(self) {
        let _ = self.control.send(Control::Stop);
        let _ = self.worker.await;
    }
}

/// Spawn the logger worker. Returns the producer handle and the owner
/// handle.
pub fn spawn(
    config: LoggerConfig,
    monitor: Arc<ErrorMonitor>,
    heartbeats: Arc<HeartbeatRegistry>,
) -> (RunLogger, LoggerHandle) {
    let (tx, rx) = data::channel(config.ring_capacity, OverflowPolicy::DropNewest);
    let shared = Arc::new(LoggerShared {
        tx: Mutex::new(tx),
        signal: Notify::new(),
        state: AtomicU8::new(SystemState::Boot as u8),
        run_id: AtomicU64::new(0),
    });
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let worker_shared = shared.clone();
    let worker = tokio::spawn(async move {
        let beat = heartbeats.register("runlog", false);
        let mut worker = Worker {
            shared: worker_shared,
            rx,
            control: control_rx,
            config,
            monitor,
            run: None,
            storage_failed: false,
            last_drop_report: Instant::now(),
            reported_drops: 0,
            last_reopen: Instant::now(),
        };
        worker.run(beat).await;
    });

    (
        RunLogger {
            shared: shared.clone(),
        },
        LoggerHandle {
            shared,
            control: control_tx,
            worker,
        },
    )
}

struct ActiveRun {
    run_id: RunId,
    path: PathBuf,
    started: DateTime<Utc>,
    file: Option<tokio::fs::File>,
    pending: Vec<u8>,
    last_flush: Instant,
    bytes_used: u64,
}

struct Worker {
    shared: Arc<LoggerShared>,
    rx: Consumer<Record>,
    control: mpsc::UnboundedReceiver<Control>,
    config: LoggerConfig,
    monitor: Arc<ErrorMonitor>,
    run: Option<ActiveRun>,
    storage_failed: bool,
    last_drop_report: Instant,
    reported_drops: u64,
    last_reopen: Instant,
}

impl Worker {
    async fn run(&mut self, beat: crate::heartbeat::BeatHandle) {
        loop {
            beat.beat();
            tokio::select! {
                // Control first: a start_run must open the file before the
                // events logged just after it are drained.
                biased;
                ctrl = self.control.recv() => {
                    match ctrl {
                        Some(Control::StartRun(run_id)) => self.start_run(run_id).await,
                        Some(Control::FinishRun(outcome)) => self.finish_run(outcome).await,
                        Some(Control::Stop) | None => {
                            self.drain_all().await;
                            self.flush(true).await;
                            self.run = None;
                            tracing::info!("run logger stopped");
                            return;
                        }
                    }
                }
                _ = self.shared.signal.notified() => {}
                _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
            }
            self.drain_batch().await;
            self.report_drops().await;
            self.retry_open_if_failed().await;
            self.flush(false).await;
        }
    }

    async fn start_run(&mut self, run_id: RunId) {
        if self.run.is_some() {
            tracing::warn!("run already active; closing it before starting a new one");
            self.finish_run(RunOutcome::Aborted).await;
        }
        let started = Utc::now();
        let dir = self.config.logs_dir();
        let file_name = format!(
            "{}_{}.csv",
            started.to_rfc3339_opts(SecondsFormat::Secs, true),
            run_id
        );
        let path = dir.join(&file_name);

        let mut run = ActiveRun {
            run_id,
            path,
            started,
            file: None,
            pending: Vec::with_capacity(FLUSH_BYTES * 2),
            last_flush: Instant::now(),
            bytes_used: dir_usage(&dir).await,
        };

        match self.open_run_file(&mut run, true).await {
            Ok(()) => {
                self.storage_failed = false;
            }
            Err(err) => self.report_storage_failure(&err),
        }

        run.pending.extend_from_slice(
            render_line(&Record {
                mono_ns: monotonic_ns(),
                wall: started,
                run_id: Some(run_id),
                state: self.shared.current_state(),
                event: LogEvent::RunStart { run_id },
            })
            .as_bytes(),
        );
        self.run = Some(run);
        self.flush(true).await;
    }

    async fn finish_run(&mut self, outcome: RunOutcome) {
        self.drain_all().await;
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let run_id = run.run_id;
        let line = render_line(&Record {
            mono_ns: monotonic_ns(),
            wall: Utc::now(),
            run_id: Some(run_id),
            state: self.shared.current_state(),
            event: LogEvent::RunEnd { run_id, outcome },
        });
        run.pending.extend_from_slice(line.as_bytes());
        self.flush(true).await;

        if let Some(run) = self.run.take() {
            self.append_manifest(&run, outcome).await;
        }
    }

    async fn open_run_file(&self, run: &mut ActiveRun, fresh: bool) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.config.logs_dir()).await?;
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        let mut file = options.open(&run.path).await?;
        if fresh {
            file.write_all(HEADER.as_bytes()).await?;
            run.bytes_used += HEADER.len() as u64;
        }
        run.file = Some(file);
        Ok(())
    }

    async fn drain_batch(&mut self) {
        for _ in 0..DRAIN_BATCH {
            match self.rx.try_pop() {
                Some(record) => self.append(record),
                None => break,
            }
        }
    }

    async fn drain_all(&mut self) {
        while let Some(record) = self.rx.try_pop() {
            self.append(record);
        }
    }

    fn append(&mut self, record: Record) {
        let Some(run) = self.run.as_mut() else {
            // No active run: events outside runs go to diagnostics only.
            tracing::trace!(kind = record.event.kind_label(), "event outside run");
            return;
        };
        let line = render_line(&record);
        run.pending.extend_from_slice(line.as_bytes());
    }

    async fn report_drops(&mut self) {
        if self.last_drop_report.elapsed() < DROP_REPORT_INTERVAL {
            return;
        }
        self.last_drop_report = Instant::now();
        let dropped = {
            let tx = self.shared.tx.lock().expect("log ring poisoned");
            tx.dropped()
        };
        if dropped > self.reported_drops {
            self.reported_drops = dropped;
            let record = Record {
                mono_ns: monotonic_ns(),
                wall: Utc::now(),
                run_id: self.shared.current_run(),
                state: self.shared.current_state(),
                event: LogEvent::EventsDropped { count: dropped },
            };
            self.append(record);
        }
    }

    async fn retry_open_if_failed(&mut self) {
        if !self.storage_failed || self.last_reopen.elapsed() < REOPEN_INTERVAL {
            return;
        }
        self.last_reopen = Instant::now();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.file.is_some() {
            self.storage_failed = false;
            return;
        }
        let dir = self.config.logs_dir();
        let path = run.path.clone();
        let reopen = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
        };
        match reopen.await {
            Ok(file) => {
                run.file = Some(file);
                self.storage_failed = false;
                tracing::info!(path = %path.display(), "run log storage recovered");
            }
            Err(err) => {
                tracing::debug!(error = %err, "run log storage still unavailable");
            }
        }
    }

    async fn flush(&mut self, force: bool) {
        enum FlushResult {
            Skipped,
            Flushed { over_quota: bool },
            Failed(std::io::Error),
        }

        let result = {
            let Some(run) = self.run.as_mut() else {
                return;
            };
            let due = force
                || run.pending.len() >= FLUSH_BYTES
                || run.last_flush.elapsed() >= FLUSH_INTERVAL;
            if !due || run.pending.is_empty() {
                FlushResult::Skipped
            } else if let Some(file) = run.file.as_mut() {
                let written = run.pending.len() as u64;
                let io = async {
                    file.write_all(&run.pending).await?;
                    file.flush().await
                }
                .await;
                match io {
                    Ok(()) => {
                        run.pending.clear();
                        run.last_flush = Instant::now();
                        run.bytes_used += written;
                        FlushResult::Flushed {
                            over_quota: run.bytes_used >= self.config.quota_bytes,
                        }
                    }
                    Err(err) => {
                        run.file = None;
                        run.pending.clear();
                        run.last_flush = Instant::now();
                        FlushResult::Failed(err)
                    }
                }
            } else {
                // Memory-only mode: storage failed, keep the buffer bounded
                // by discarding what would have been written.
                run.pending.clear();
                run.last_flush = Instant::now();
                FlushResult::Skipped
            }
        };

        match result {
            FlushResult::Skipped => {}
            FlushResult::Flushed { over_quota: true } => self.enforce_quota().await,
            FlushResult::Flushed { over_quota: false } => {}
            FlushResult::Failed(err) => self.report_storage_failure(&err),
        }
    }

    fn report_storage_failure(&mut self, err: &std::io::Error) {
        if self.storage_failed {
            return;
        }
        self.storage_failed = true;
        self.last_reopen = Instant::now();
        let kind = if err.raw_os_error() == Some(ENOSPC) {
            FaultKind::StorageFull
        } else {
            FaultKind::StorageMissing
        };
        self.monitor
            .notify(Fault::new(kind, "runlog", &format!("run log write: {}", err)));
    }

    /// Delete oldest completed run files until usage is back under quota.
    async fn enforce_quota(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let dir = self.config.logs_dir();
        let mut files = list_run_files(&dir).await;
        files.retain(|(path, _)| *path != run.path);
        // RFC3339-prefixed names sort chronologically.
        files.sort();

        let mut usage = dir_usage(&dir).await;
        let mut deleted = 0usize;
        for (path, size) in files {
            if usage < self.config.quota_bytes {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    usage = usage.saturating_sub(size);
                    deleted += 1;
                    tracing::info!(path = %path.display(), "rotated out old run log");
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to rotate run log");
                }
            }
        }
        run.bytes_used = usage;
        if deleted > 0 {
            self.monitor.notify(Fault::new(
                FaultKind::StorageFull,
                "runlog",
                &format!("storage quota reached, rotated {} run file(s)", deleted),
            ));
        }
    }

    async fn append_manifest(&self, run: &ActiveRun, outcome: RunOutcome) {
        let path = self.config.logs_dir().join("manifest.json");
        let mut entries: Vec<ManifestEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        entries.push(ManifestEntry {
            run_id: run.run_id.0,
            file: run
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            started: run.started.to_rfc3339_opts(SecondsFormat::Secs, true),
            outcome: outcome.label().to_string(),
        });
        match serde_json::to_vec_pretty(&entries) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(error = %err, "failed to update run manifest");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode run manifest"),
        }
    }
}

async fn list_run_files(dir: &Path) -> Vec<(PathBuf, u64)> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            files.push((path, meta.len()));
        }
    }
    files
}

async fn dir_usage(dir: &Path) -> u64 {
    list_run_files(dir).await.iter().map(|(_, s)| s).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::bounded_msg;

    fn test_config(root: &Path, ring: usize) -> LoggerConfig {
        LoggerConfig {
            root: root.to_path_buf(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            ring_capacity: ring,
        }
    }

    fn deps() -> (Arc<ErrorMonitor>, Arc<HeartbeatRegistry>) {
        (
            Arc::new(ErrorMonitor::new()),
            Arc::new(HeartbeatRegistry::new()),
        )
    }

    #[test]
    fn escaping_protects_commas_and_newlines() {
        let mut out = String::new();
        escape_into(&mut out, "a,b\nc\\d");
        assert_eq!(out, "a\\,b\\nc\\\\d");
    }

    #[test]
    fn rendered_line_has_nine_columns() {
        let record = Record {
            mono_ns: 42,
            wall: Utc::now(),
            run_id: Some(RunId(7)),
            state: SystemState::Running,
            event: LogEvent::CommandSent {
                device: Device::PulseGen,
                token: 3,
                opcode: Opcode::Fire,
            },
        };
        let line = render_line(&record);
        assert_eq!(line.matches(',').count(), 8, "line: {line}");
        assert!(line.contains(",running,command_sent,pulsegen,3,,FIRE"));
    }

    #[tokio::test]
    async fn event_reaches_file_within_flush_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, beats) = deps();
        let (logger, handle) = spawn(test_config(dir.path(), EVENT_RING), monitor, beats);

        let run_id = RunId(1234);
        handle.start_run(run_id);
        logger.log(LogEvent::CommandSent {
            device: Device::PowerSupply,
            token: 1,
            opcode: Opcode::Enable,
        });

        tokio::time::sleep(Duration::from_millis(200)).await;

        let logs: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
            .collect();
        assert_eq!(logs.len(), 1);
        let content = std::fs::read_to_string(&logs[0]).unwrap();
        assert!(content.starts_with(HEADER));
        assert!(content.contains("run_start"));
        assert!(content.contains("command_sent"));
        assert!(content.contains("1234"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn finish_run_writes_terminal_event_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, beats) = deps();
        let (logger, handle) = spawn(test_config(dir.path(), EVENT_RING), monitor, beats);

        handle.start_run(RunId(55));
        logger.log(LogEvent::StepEntered {
            protocol: bounded_msg("lysis"),
            step: bounded_msg("prepare"),
        });
        handle.finish_run(RunOutcome::Completed);
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        let logs_dir = dir.path().join("logs");
        let csv = std::fs::read_dir(&logs_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
            .unwrap();
        let content = std::fs::read_to_string(csv).unwrap();
        assert!(content.contains("run_end"));
        assert!(content.contains("completed"));
        assert!(content.contains("lysis/prepare"));

        let manifest: Vec<ManifestEntry> =
            serde_json::from_slice(&std::fs::read(logs_dir.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].run_id, 55);
        assert_eq!(manifest[0].outcome, "completed");
    }

    #[tokio::test]
    async fn overflow_is_counted_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, beats) = deps();
        // Tiny ring so the producer outruns the worker deterministically.
        let (logger, handle) = spawn(test_config(dir.path(), 8), monitor, beats);

        handle.start_run(RunId(9));
        // Burst far past capacity before the worker can drain: the producer
        // lock starves the worker briefly, so some events must drop.
        for i in 0..4096u32 {
            logger.log(LogEvent::CommandSent {
                device: Device::Pump,
                token: i,
                opcode: Opcode::Run,
            });
        }
        assert!(logger.dropped() > 0);

        // Synthetic report appears after the >=1s reporting interval.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        handle.finish_run(RunOutcome::Completed);
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        let logs_dir = dir.path().join("logs");
        let csv = std::fs::read_dir(&logs_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
            .unwrap();
        let content = std::fs::read_to_string(csv).unwrap();
        assert!(content.contains("events_dropped"));
    }

    #[tokio::test]
    async fn quota_rotation_deletes_oldest_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();
        // A pre-existing completed run occupying most of a tiny quota.
        let old = logs_dir.join("2024-01-01T00:00:00Z_1.csv");
        std::fs::write(&old, vec![b'x'; 4096]).unwrap();

        let (monitor, beats) = deps();
        let config = LoggerConfig {
            root: dir.path().to_path_buf(),
            quota_bytes: 4096,
            ring_capacity: EVENT_RING,
        };
        let (logger, handle) = spawn(config, monitor.clone(), beats);

        handle.start_run(RunId(2));
        logger.log(LogEvent::CommandSent {
            device: Device::Pump,
            token: 1,
            opcode: Opcode::Run,
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.finish_run(RunOutcome::Completed);
        handle.stop().await;

        assert!(!old.exists(), "oldest run should have been rotated out");
        let kinds: Vec<_> = monitor.drain().into_iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FaultKind::StorageFull));
    }

    #[tokio::test]
    async fn storage_failure_reports_once_and_survives() {
        let dir = tempfile::tempdir().unwrap();
        // Make `<root>/logs` impossible: root is a file.
        let root = dir.path().join("occupied");
        std::fs::write(&root, b"not a directory").unwrap();

        let (monitor, beats) = deps();
        let (logger, handle) = spawn(test_config(&root, EVENT_RING), monitor.clone(), beats);

        handle.start_run(RunId(3));
        for i in 0..100u32 {
            logger.log(LogEvent::CommandSent {
                device: Device::Pump,
                token: i,
                opcode: Opcode::Stop,
            });
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let kinds: Vec<_> = monitor.drain().into_iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FaultKind::StorageMissing));

        // Logger keeps accepting events and shuts down cleanly.
        logger.log(LogEvent::EventsDropped { count: 0 });
        handle.stop().await;
    }
}
