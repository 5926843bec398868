//! End-to-end protocol engine scenarios over loopback serial channels.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{line_index, read_run_csv, silent, withhold_first, ScriptedOpener};
use instrumentd::error::FaultKind;
use instrumentd::heartbeat::HeartbeatRegistry;
use instrumentd::monitor::ErrorMonitor;
use instrumentd::parameter::{Parameter, ParameterStore};
use instrumentd::protocol::{
    ArgSource, CleanupStep, Outcome, Protocol, ProtocolEngine, StepDef,
};
use instrumentd::rpc::{Device, Opcode, RpcMux};
use instrumentd::runlog::{self, LoggerConfig, RunId};
use tokio_util::sync::CancellationToken;

struct Rig {
    rpc: Arc<RpcMux>,
    params: Arc<ParameterStore>,
    monitor: Arc<ErrorMonitor>,
    log: instrumentd::runlog::RunLogger,
    handle: instrumentd::runlog::LoggerHandle,
}

async fn rig(opener: ScriptedOpener, root: &std::path::Path) -> Rig {
    let monitor = Arc::new(ErrorMonitor::new());
    let heartbeats = Arc::new(HeartbeatRegistry::new());
    let rpc = Arc::new(RpcMux::new(
        Arc::new(opener),
        monitor.clone(),
        heartbeats.clone(),
        [false; Device::COUNT],
    ));
    rpc.connect().await.expect("connect");
    let (log, handle) = runlog::spawn(LoggerConfig::new(root), monitor.clone(), heartbeats);
    Rig {
        rpc,
        params: Arc::new(ParameterStore::new()),
        monitor,
        log,
        handle,
    }
}

fn engine(rig: &Rig, protocol: Protocol, cancel: CancellationToken) -> ProtocolEngine {
    ProtocolEngine::new(
        Arc::new(protocol),
        rig.rpc.clone(),
        rig.params.clone(),
        rig.log.clone(),
        rig.monitor.clone(),
        cancel,
    )
}

fn step(name: &str, device: Device, opcode: Opcode, deadline: Duration) -> StepDef {
    StepDef {
        name: name.to_string(),
        device,
        opcode,
        args: vec![ArgSource::Param(Parameter::Voltage)],
        deadline,
        retries: 2,
    }
}

fn three_step_protocol(pulse_deadline: Duration) -> Protocol {
    Protocol {
        name: "lysis".to_string(),
        steps: vec![
            step("prepare", Device::PowerSupply, Opcode::Enable, Duration::from_secs(2)),
            step("pulse", Device::PulseGen, Opcode::Fire, pulse_deadline),
            step("flush", Device::Pump, Opcode::Run, Duration::from_secs(2)),
        ],
        abort_sequence: vec![
            CleanupStep {
                device: Device::PowerSupply,
                opcode: Opcode::Disable,
                args: Vec::new(),
                deadline: Duration::from_secs(1),
            },
            CleanupStep {
                device: Device::Pump,
                opcode: Opcode::Stop,
                args: Vec::new(),
                deadline: Duration::from_secs(1),
            },
        ],
    }
}

/// S1: every step acknowledged; the run completes and the trace is ordered.
#[tokio::test]
async fn happy_path_produces_ordered_trace() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(ScriptedOpener::new(), dir.path()).await;

    let protocol = instrumentd::protocol::library::lysis();

    rig.handle.start_run(RunId(1));
    let outcome = engine(&rig, protocol, CancellationToken::new()).run().await;
    assert_eq!(outcome, Outcome::Completed);
    rig.handle.finish_run(outcome.as_run_outcome());
    rig.handle.stop().await;

    let csv = read_run_csv(dir.path());
    let run_start = line_index(&csv, "run_start", "");
    let prepare = line_index(&csv, "step_entered", "lysis/prepare");
    let cs_psu = line_index(&csv, "command_sent", "psu");
    let pulse = line_index(&csv, "step_entered", "lysis/pulse");
    let cs_pulsegen = line_index(&csv, "command_sent", "pulsegen");
    let flush = line_index(&csv, "step_entered", "lysis/flush");
    let cs_pump = line_index(&csv, "command_sent", "pump");
    let run_end = line_index(&csv, "run_end", "completed");

    assert!(run_start < prepare);
    assert!(prepare < cs_psu && cs_psu < pulse);
    assert!(pulse < cs_pulsegen && cs_pulsegen < flush);
    assert!(flush < cs_pump && cs_pump < run_end);

    let responses = csv
        .lines()
        .filter(|l| l.split(',').nth(4) == Some("response_received"))
        .count();
    assert_eq!(responses, 3);
}

/// S2: the pulse generator withholds its first reply; the step times out,
/// retries with a fresh token, and the run still completes.
#[tokio::test]
async fn timeout_retries_with_fresh_token() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::new().with(Device::PulseGen, withhold_first(1));
    let rig = rig(opener, dir.path()).await;

    let protocol = three_step_protocol(Duration::from_millis(150));

    rig.handle.start_run(RunId(2));
    let outcome = engine(&rig, protocol, CancellationToken::new()).run().await;
    assert_eq!(outcome, Outcome::Completed);
    rig.handle.finish_run(outcome.as_run_outcome());
    rig.handle.stop().await;

    let csv = read_run_csv(dir.path());
    let pulse_sends: Vec<&str> = csv
        .lines()
        .filter(|l| l.split(',').nth(4) == Some("command_sent") && l.contains("pulsegen"))
        .collect();
    assert_eq!(pulse_sends.len(), 2, "expected a retry:\n{}", csv);
    // The retry used a fresh correlation token.
    let token = |line: &str| line.split(',').nth(6).unwrap().to_string();
    assert_ne!(token(pulse_sends[0]), token(pulse_sends[1]));

    let kinds: Vec<_> = rig.monitor.drain().into_iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&FaultKind::SerialTimeout));
}

/// Retry budget exhaustion routes into the abort path and cleanup runs.
#[tokio::test]
async fn exhausted_retries_abort_with_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::new().with(Device::PulseGen, silent());
    let rig = rig(opener, dir.path()).await;

    let protocol = three_step_protocol(Duration::from_millis(80));

    rig.handle.start_run(RunId(3));
    let outcome = engine(&rig, protocol, CancellationToken::new()).run().await;
    assert_eq!(outcome, Outcome::Aborted);
    rig.handle.finish_run(outcome.as_run_outcome());
    rig.handle.stop().await;

    let csv = read_run_csv(dir.path());
    let fire = line_index(&csv, "command_sent", "FIRE");
    let power_off = line_index(&csv, "command_sent", "DIS");
    let pump_stop = line_index(&csv, "command_sent", "STOP");
    let run_end = line_index(&csv, "run_end", "aborted");
    assert!(fire < power_off && power_off < pump_stop && pump_stop < run_end);

    let kinds: Vec<_> = rig.monitor.drain().into_iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&FaultKind::ProtocolAbort));
}

/// S5: external cancellation unblocks the in-flight await promptly and the
/// abort path executes its cleanup commands.
#[tokio::test]
async fn cancellation_unblocks_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::new().with(Device::PulseGen, silent());
    let rig = rig(opener, dir.path()).await;

    // Long deadline: only cancellation can unblock the pulse step.
    let protocol = three_step_protocol(Duration::from_secs(30));
    let cancel = CancellationToken::new();

    rig.handle.start_run(RunId(4));
    let run = engine(&rig, protocol, cancel.clone()).run();
    let run = tokio::spawn(run);

    // Let the engine get into the pulse step, then pull the plug.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let cancelled_at = std::time::Instant::now();
    cancel.cancel();

    let outcome = run.await.unwrap();
    assert_eq!(outcome, Outcome::Aborted);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "abort took {:?}",
        cancelled_at.elapsed()
    );

    rig.handle.finish_run(outcome.as_run_outcome());
    rig.handle.stop().await;

    let csv = read_run_csv(dir.path());
    let fire = line_index(&csv, "command_sent", "FIRE");
    let power_off = line_index(&csv, "command_sent", "DIS");
    assert!(fire < power_off);
    assert!(csv.contains("run_end"));
}

/// S6: a parameter write during a step does not retroactively change the
/// snapshot the step dispatched with.
#[tokio::test]
async fn snapshot_isolates_running_step_from_writes() {
    let dir = tempfile::tempdir().unwrap();
    // Withhold the first PSU reply long enough to write a parameter while
    // the prepare step is in flight, and record every frame we receive.
    let frames: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = frames.clone();
    let behavior: common::Behavior = Arc::new(move |nth, line: &str| {
        recorder.lock().unwrap().push(line.to_string());
        if nth < 1 {
            None
        } else {
            line.split_whitespace()
                .next()
                .map(|token| format!("{} OK\r\n", token))
        }
    });
    let opener = ScriptedOpener::new().with(Device::PowerSupply, behavior);
    let rig = rig(opener, dir.path()).await;
    rig.params.set(Parameter::Voltage, 12.0).unwrap();
    let change_log = rig.log.clone();
    rig.params.subscribe(Arc::new(move |key, old, new| {
        change_log.log(instrumentd::runlog::LogEvent::ParameterChanged { key, old, new });
    }));

    let protocol = Protocol {
        name: "single".to_string(),
        steps: vec![step(
            "prepare",
            Device::PowerSupply,
            Opcode::Enable,
            Duration::from_millis(200),
        )],
        abort_sequence: Vec::new(),
    };

    rig.handle.start_run(RunId(5));
    let run = tokio::spawn(engine(&rig, protocol, CancellationToken::new()).run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.params.set(Parameter::Voltage, 24.0).unwrap();

    let outcome = run.await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    rig.handle.finish_run(outcome.as_run_outcome());
    rig.handle.stop().await;

    // Both the original dispatch and the retry carried the snapshot value.
    let seen = frames.lock().unwrap();
    assert_eq!(seen.len(), 2, "expected initial send plus retry: {:?}", seen);
    for frame in seen.iter() {
        assert!(frame.contains("12.000"), "snapshot leaked: {}", frame);
    }

    let csv = read_run_csv(dir.path());
    assert!(csv.contains("parameter_changed"));
    assert!(csv.contains("voltage=12->24"));
}
