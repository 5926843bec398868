//! Top-level lifecycle state machine.
//!
//! The coordinator owns every subsystem: the multiplexer, the run logger,
//! the error monitor, the parameter store, the status panel, and the input
//! poller. At most one [`ProtocolEngine`] exists, and only in the `Running`
//! and `Aborting` states. The main loop is single-threaded and
//! cooperative: every 100 ms tick it drains fault escalations, services
//! the engine outcome and operator input, checks heartbeats (once a
//! second), and refreshes the display. All state transitions happen on
//! this loop, so they are totally ordered.
//!
//! ```text
//! Boot -> Init -> Idle <-> Running -> Finished -> Idle
//!                   |         \-> Aborting -> Idle
//!                   v              v
//!                 Error <----------/   (ack + successful reinit -> Idle)
//! ```
//!
//! `Error` is sticky: leaving it requires operator acknowledgement *and* a
//! successful reinit pass (serial revive + storage check). The coordinator
//! never re-enters `Running` from `Error` directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{ControlError, Fault, FaultKind};
use crate::heartbeat::HeartbeatRegistry;
use crate::monitor::ErrorMonitor;
use crate::parameter::{Parameter, ParameterStore};
use crate::protocol::{Outcome, Protocol, ProtocolEngine};
use crate::rpc::{Device, PortOpener, RpcMux};
use crate::runlog::{self, LogEvent, LoggerHandle, RunId, RunLogger, RunOutcome};
use crate::ui::input::{self, InputEvent, RawInput};
use crate::ui::{Screen, StatusPanel};

/// Main loop cadence.
const TICK: Duration = Duration::from_millis(100);
/// Heartbeats are checked every this many ticks (1 s).
const HEARTBEAT_EVERY: u64 = 10;
/// Grace given to a cancelled engine during shutdown.
const ENGINE_DRAIN: Duration = Duration::from_secs(5);

/// Coordinator FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SystemState {
    Boot = 0,
    Init = 1,
    Idle = 2,
    Running = 3,
    Finished = 4,
    Aborting = 5,
    Error = 6,
}

impl SystemState {
    pub fn label(&self) -> &'static str {
        match self {
            SystemState::Boot => "boot",
            SystemState::Init => "init",
            SystemState::Idle => "idle",
            SystemState::Running => "running",
            SystemState::Finished => "finished",
            SystemState::Aborting => "aborting",
            SystemState::Error => "error",
        }
    }

    pub(crate) fn from_index(value: u8) -> SystemState {
        match value {
            0 => SystemState::Boot,
            1 => SystemState::Init,
            2 => SystemState::Idle,
            3 => SystemState::Running,
            4 => SystemState::Finished,
            5 => SystemState::Aborting,
            _ => SystemState::Error,
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The FSM's transition table. Shutdown bypasses this (any state may fall
/// back to `Idle` on process exit).
pub fn valid_transition(from: SystemState, to: SystemState) -> bool {
    use SystemState::*;
    matches!(
        (from, to),
        (Boot, Init)
            | (Init, Idle)
            | (Init, Error)
            | (Idle, Running)
            | (Idle, Error)
            | (Running, Finished)
            | (Running, Aborting)
            | (Running, Error)
            | (Aborting, Idle)
            | (Aborting, Error)
            | (Finished, Idle)
            | (Finished, Error)
            | (Error, Idle)
    )
}

/// External collaborators injected at construction: the serial opener, the
/// raw input lines, the panel driver, and (for SIGHUP reloads) the config
/// file path. Tests substitute loopback implementations for all of them.
pub struct Deps {
    pub opener: Arc<dyn PortOpener>,
    /// `None` skips the poller; events can then be injected directly via
    /// [`SystemCoordinator::input_sender`].
    pub raw_input: Option<Box<dyn RawInput>>,
    pub panel: Box<dyn StatusPanel>,
    pub config_path: Option<PathBuf>,
}

struct ActiveEngine {
    run_id: RunId,
    cancel: CancellationToken,
    outcome_rx: oneshot::Receiver<Outcome>,
    task: tokio::task::JoinHandle<()>,
}

enum EngineEvent {
    Pending,
    Done(Outcome),
    Died,
}

/// The supervisor. Construct with [`SystemCoordinator::new`] inside a
/// running tokio runtime, then drive with [`SystemCoordinator::run`].
pub struct SystemCoordinator {
    settings: Settings,
    root: PathBuf,
    config_path: Option<PathBuf>,
    state: SystemState,
    state_tx: watch::Sender<SystemState>,
    params: Arc<ParameterStore>,
    monitor: Arc<ErrorMonitor>,
    heartbeats: Arc<HeartbeatRegistry>,
    rpc: Arc<RpcMux>,
    log: RunLogger,
    log_handle: Option<LoggerHandle>,
    panel: Box<dyn StatusPanel>,
    raw_input: Option<Box<dyn RawInput>>,
    input_tx: mpsc::Sender<InputEvent>,
    input_rx: mpsc::Receiver<InputEvent>,
    input_task: Option<tokio::task::JoinHandle<()>>,
    protocol: Arc<Protocol>,
    engine: Option<ActiveEngine>,
    selected: usize,
    shutdown: CancellationToken,
    reload_flag: Arc<AtomicBool>,
    notice: Option<String>,
}

impl SystemCoordinator {
    pub fn new(settings: Settings, root: PathBuf, deps: Deps, shutdown: CancellationToken) -> Self {
        let params = Arc::new(ParameterStore::new());
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let rpc = Arc::new(RpcMux::new(
            deps.opener,
            monitor.clone(),
            heartbeats.clone(),
            settings.crc_flags(),
        ));
        let protocol = Arc::new(settings.to_protocol());
        let (log, log_handle) = runlog::spawn(
            settings.logger_config(&root),
            monitor.clone(),
            heartbeats.clone(),
        );
        let (input_tx, input_rx) = mpsc::channel(32);
        let (state_tx, _) = watch::channel(SystemState::Boot);

        Self {
            settings,
            root,
            config_path: deps.config_path,
            state: SystemState::Boot,
            state_tx,
            params,
            monitor,
            heartbeats,
            rpc,
            log,
            log_handle: Some(log_handle),
            panel: deps.panel,
            raw_input: deps.raw_input,
            input_tx,
            input_rx,
            input_task: None,
            protocol,
            engine: None,
            selected: 0,
            shutdown,
            reload_flag: Arc::new(AtomicBool::new(false)),
            notice: None,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    /// Observe state transitions from outside the loop.
    pub fn watch_state(&self) -> watch::Receiver<SystemState> {
        self.state_tx.subscribe()
    }

    /// Flag checked each tick; set by the SIGHUP handler.
    pub fn reload_flag(&self) -> Arc<AtomicBool> {
        self.reload_flag.clone()
    }

    /// Direct event injection, used when no raw input device is attached.
    pub fn input_sender(&self) -> mpsc::Sender<InputEvent> {
        self.input_tx.clone()
    }

    pub fn parameters(&self) -> Arc<ParameterStore> {
        self.params.clone()
    }

    pub fn error_monitor(&self) -> Arc<ErrorMonitor> {
        self.monitor.clone()
    }

    /// Boot, supervise until shutdown, then tear down in reverse
    /// dependency order. A boot-time failure is returned to the caller for
    /// exit-code mapping.
    pub async fn run(&mut self) -> Result<(), ControlError> {
        self.transition(SystemState::Init);
        if let Err(err) = self.initialize().await {
            tracing::error!(error = %err, "initialization failed");
            self.transition(SystemState::Error);
            self.notice = Some(err.to_string());
            self.refresh_display();
            // The logger still deserves a clean stop even on failed boot.
            if let Some(handle) = self.log_handle.take() {
                handle.stop().await;
            }
            return Err(err);
        }
        self.transition(SystemState::Idle);
        self.main_loop().await;
        self.shutdown_sequence().await;
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), ControlError> {
        let logs_dir = self.root.join("logs");
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .map_err(|err| ControlError::StorageUnavailable(format!("{}: {}", logs_dir.display(), err)))?;

        for (key, bounds, default) in self.settings.parameter_table() {
            self.params.configure(key, bounds, default);
        }
        let change_log = self.log.clone();
        self.params.subscribe(Arc::new(move |key, old, new| {
            change_log.log(LogEvent::ParameterChanged { key, old, new });
        }));

        self.rpc.connect().await?;

        if let Some(raw) = self.raw_input.take() {
            let beat = self.heartbeats.register("input", false);
            self.input_task = Some(input::spawn_poller(
                raw,
                self.settings.poll_interval(),
                self.settings.long_press(),
                self.input_tx.clone(),
                beat,
                self.shutdown.child_token(),
            ));
        }

        tracing::info!(root = %self.root.display(), protocol = %self.protocol.name, "subsystems initialized");
        Ok(())
    }

    async fn main_loop(&mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            ticks += 1;
            self.service_faults();
            self.service_engine();
            self.service_input().await;
            if ticks % HEARTBEAT_EVERY == 0 {
                self.check_heartbeats();
            }
            self.service_reload();
            self.refresh_display();
        }
    }

    /// Drain the escalation queue. Every fault is logged to the run trace;
    /// a permanently lost channel escalates to abort or Error depending on
    /// state.
    fn service_faults(&mut self) {
        for fault in self.monitor.drain() {
            self.log.log(LogEvent::fault(&fault));
            if fault.kind == FaultKind::SerialIo {
                let lost: Vec<Device> = Device::ALL
                    .into_iter()
                    .filter(|d| !self.rpc.available(*d))
                    .collect();
                if lost.is_empty() {
                    continue;
                }
                match self.state {
                    SystemState::Running => self.request_abort("serial channel failed"),
                    SystemState::Idle | SystemState::Finished => {
                        self.enter_error(format!("{} channel failed", lost[0]));
                    }
                    _ => {}
                }
            }
        }
    }

    fn service_engine(&mut self) {
        let event = match self.engine.as_mut() {
            None => return,
            Some(active) => match active.outcome_rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => EngineEvent::Pending,
                Ok(outcome) => EngineEvent::Done(outcome),
                Err(oneshot::error::TryRecvError::Closed) => EngineEvent::Died,
            },
        };

        match event {
            EngineEvent::Pending => {}
            EngineEvent::Done(outcome) => {
                let active = self.engine.take().expect("engine present");
                tracing::info!(run = %active.run_id, outcome = ?outcome, "run terminated");
                if let Some(handle) = &self.log_handle {
                    handle.finish_run(outcome.as_run_outcome());
                }
                match outcome {
                    Outcome::Completed if self.state == SystemState::Running => {
                        self.notice = Some("run complete".to_string());
                        self.transition(SystemState::Finished);
                    }
                    Outcome::Completed => {
                        // Completion raced an abort request; nothing left to
                        // clean up.
                        self.transition(SystemState::Idle);
                    }
                    Outcome::Failed { reason } => self.enter_error(reason),
                    Outcome::Aborted => {
                        if Device::ALL.iter().any(|d| !self.rpc.available(*d)) {
                            self.enter_error("required device unavailable".to_string());
                        } else {
                            self.transition(SystemState::Idle);
                        }
                    }
                }
            }
            EngineEvent::Died => {
                let active = self.engine.take().expect("engine present");
                active.task.abort();
                if let Some(handle) = &self.log_handle {
                    handle.finish_run(RunOutcome::Failed);
                }
                self.enter_error("protocol engine task failed".to_string());
            }
        }
    }

    async fn service_input(&mut self) {
        while let Ok(event) = self.input_rx.try_recv() {
            tracing::debug!(?event, state = %self.state, "operator input");
            match (self.state, event) {
                (SystemState::Idle, InputEvent::KnobRight) => self.adjust_selected(1),
                (SystemState::Idle, InputEvent::KnobLeft) => self.adjust_selected(-1),
                (SystemState::Idle, InputEvent::LongPress) => {
                    self.selected = (self.selected + 1) % Parameter::COUNT;
                }
                (SystemState::Idle, InputEvent::ShortPress) => self.start_run(),
                (SystemState::Running, InputEvent::LongPress) => {
                    self.request_abort("operator abort");
                }
                (SystemState::Finished, _) => self.transition(SystemState::Idle),
                (SystemState::Error, _) => self.acknowledge_error().await,
                _ => {}
            }
        }
    }

    fn adjust_selected(&mut self, steps: i32) {
        let key = Parameter::ALL[self.selected];
        if let Err(err) = self.params.adjust(key, steps) {
            tracing::debug!(key = %key, error = %err, "adjustment rejected");
        }
    }

    fn start_run(&mut self) {
        if self.engine.is_some() {
            return;
        }
        if Device::ALL.iter().any(|d| !self.rpc.available(*d)) {
            self.notice = Some("device unavailable".to_string());
            return;
        }
        let run_id = RunId::generate();
        if let Some(handle) = &self.log_handle {
            handle.start_run(run_id);
        }
        let cancel = self.shutdown.child_token();
        let engine = ProtocolEngine::new(
            self.protocol.clone(),
            self.rpc.clone(),
            self.params.clone(),
            self.log.clone(),
            self.monitor.clone(),
            cancel.clone(),
        );
        let (task, outcome_rx) = engine.spawn();
        self.engine = Some(ActiveEngine {
            run_id,
            cancel,
            outcome_rx,
            task,
        });
        tracing::info!(run = %run_id, protocol = %self.protocol.name, "run started");
        self.transition(SystemState::Running);
    }

    fn request_abort(&mut self, reason: &str) {
        let Some(active) = &self.engine else {
            return;
        };
        if self.state == SystemState::Aborting {
            return;
        }
        tracing::warn!(run = %active.run_id, reason, "aborting run");
        active.cancel.cancel();
        self.transition(SystemState::Aborting);
    }

    fn enter_error(&mut self, reason: String) {
        if self.state == SystemState::Error {
            self.notice = Some(reason);
            return;
        }
        tracing::error!(reason = %reason, "entering error state");
        self.notice = Some(reason);
        if let Some(active) = &self.engine {
            active.cancel.cancel();
        }
        self.transition(SystemState::Error);
    }

    /// Operator acknowledgement in Error: run a reinit pass and return to
    /// Idle only when it succeeds.
    async fn acknowledge_error(&mut self) {
        let serial_ok = self.rpc.revive().await;
        let storage_ok = tokio::fs::create_dir_all(self.root.join("logs")).await.is_ok();
        if serial_ok && storage_ok {
            tracing::info!("reinit succeeded, returning to idle");
            self.transition(SystemState::Idle);
        } else {
            tracing::warn!(serial_ok, storage_ok, "reinit failed, staying in error");
            self.notice = Some("reinit failed; check device and storage".to_string());
        }
    }

    fn check_heartbeats(&mut self) {
        for stall in self.heartbeats.stalled() {
            self.log.log(LogEvent::HeartbeatMissed { task: stall.name });
            self.monitor.notify(Fault::new(
                FaultKind::ThreadStall,
                "coordinator",
                &format!("task {} stopped heartbeating", stall.name),
            ));
            if stall.restartable {
                self.restart_task(stall.name);
            } else {
                self.enter_error(format!("background task {} stalled", stall.name));
            }
        }
    }

    fn restart_task(&mut self, name: &'static str) {
        let device = match name {
            "reader:psu" => Some(Device::PowerSupply),
            "reader:pulsegen" => Some(Device::PulseGen),
            "reader:pump" => Some(Device::Pump),
            _ => None,
        };
        match device {
            Some(device) => {
                tracing::warn!(task = name, "restarting stalled reader");
                self.rpc.restart_reader(device);
            }
            None => {
                tracing::warn!(task = name, "no restart handler for stalled task");
            }
        }
    }

    fn service_reload(&mut self) {
        if !self.reload_flag.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.state != SystemState::Idle {
            tracing::warn!(state = %self.state, "config reload rejected outside idle");
            return;
        }
        let Some(path) = self.config_path.clone() else {
            tracing::warn!("config reload requested but no config path is known");
            return;
        };
        match Settings::load(&path) {
            Ok(settings) => {
                for (key, bounds, default) in settings.parameter_table() {
                    self.params.configure(key, bounds, default);
                }
                self.protocol = Arc::new(settings.to_protocol());
                self.settings = settings;
                tracing::info!(path = %path.display(), "configuration reloaded");
            }
            Err(err) => {
                self.monitor.notify(Fault::new(
                    FaultKind::ConfigInvalid,
                    "coordinator",
                    &format!("reload rejected: {}", err),
                ));
            }
        }
    }

    fn refresh_display(&mut self) {
        let selected = Parameter::ALL[self.selected];
        let screen = Screen {
            state: self.state,
            selected,
            value: self.params.get(selected),
            run_id: self.engine.as_ref().map(|a| a.run_id),
            notice: self.notice.clone(),
        };
        if let Err(err) = self.panel.render(&screen) {
            self.monitor.notify(Fault::new(
                FaultKind::DisplayIo,
                "display",
                &format!("render failed: {}", err),
            ));
        }
    }

    /// Tear down in reverse dependency order: engine, multiplexer, input,
    /// logger.
    async fn shutdown_sequence(&mut self) {
        tracing::info!("shutdown sequence starting");
        if let Some(active) = self.engine.take() {
            active.cancel.cancel();
            match tokio::time::timeout(ENGINE_DRAIN, active.outcome_rx).await {
                Ok(Ok(outcome)) => {
                    if let Some(handle) = &self.log_handle {
                        handle.finish_run(outcome.as_run_outcome());
                    }
                }
                _ => {
                    active.task.abort();
                    if let Some(handle) = &self.log_handle {
                        handle.finish_run(RunOutcome::Aborted);
                    }
                }
            }
        }
        self.rpc.shutdown().await;
        if let Some(task) = self.input_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        if let Some(handle) = self.log_handle.take() {
            handle.stop().await;
        }
        // Clean shutdown terminates in Idle regardless of the path here.
        self.state = SystemState::Idle;
        let _ = self.state_tx.send(SystemState::Idle);
        tracing::info!("shutdown complete");
    }

    fn transition(&mut self, to: SystemState) {
        if self.state == to {
            return;
        }
        debug_assert!(
            valid_transition(self.state, to),
            "invalid transition {} -> {}",
            self.state,
            to
        );
        tracing::info!(from = %self.state, to = %to, "state transition");
        self.state = to;
        let _ = self.state_tx.send(to);
        self.log.set_state(to);
        if !matches!(to, SystemState::Error | SystemState::Finished) {
            self.notice = None;
        }
    }
}
