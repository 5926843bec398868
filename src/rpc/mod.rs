//! Serial RPC multiplexer.
//!
//! One channel per peripheral, one reader task per channel, one shared
//! 1 ms timer expiring deadlines. [`RpcMux::send`] allocates a correlation
//! token, records an in-flight entry, writes the framed command, and hands
//! back a [`Pending`] the caller awaits. Every dispatched command reaches
//! exactly one terminal outcome: a matched [`wire::Response`], `Timeout`,
//! `Cancelled`, `ChannelDown`, or `ChannelUnavailable`. Nothing vanishes
//! silently.
//!
//! # Locking
//!
//! The per-device in-flight table lives behind a `std::sync::Mutex` held
//! only for table mutation, never across I/O or `.await`. Writes to a
//! channel are serialized by a per-device async lock. `send` performs no
//! heap-free-path allocation beyond the frame string itself and publishes
//! the write to the OS without holding any table lock.
//!
//! # Reconnect policy
//!
//! On channel loss the reader fails all in-flight entries for that device
//! and kicks off reconnect with exponential backoff (100 ms initial,
//! doubling) bounded by a 5 s wall-clock budget. When the budget runs out
//! the channel is permanently down and `send` returns
//! [`RpcError::ChannelUnavailable`] immediately until a `revive` pass
//! (operator-acknowledged reinit) succeeds.

pub mod channel;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::data::{self, OverflowPolicy};
use crate::error::{ControlError, Fault, FaultKind};
use crate::heartbeat::HeartbeatRegistry;
use crate::monitor::ErrorMonitor;

pub use channel::{DynSerial, PortOpener, TtyOpener, TtySettings};
pub use wire::{Args, Command, Device, Opcode, Response, Status};

/// Reader poll interval; bounds how stale a reader heartbeat can be.
const READ_POLL: Duration = Duration::from_millis(10);
/// Deadline-expiry timer tick.
const TIMER_TICK: Duration = Duration::from_millis(1);
/// Inbound line queue capacity per device.
const LINE_RING: usize = 256;
/// First reconnect delay; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Ceiling for a single reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Total wall-clock reconnect budget before a channel is declared
/// permanently failed.
const RECONNECT_BUDGET: Duration = Duration::from_secs(5);
/// Stale-byte drain window after (re)opening a port.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Terminal non-response outcomes for a dispatched command.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// The absolute deadline elapsed before a matching reply arrived.
    #[error("request deadline elapsed")]
    Timeout,
    /// The request was cancelled by `abort_in_flight` or shutdown.
    #[error("request cancelled")]
    Cancelled,
    /// The channel failed while the request was in flight.
    #[error("serial channel lost")]
    ChannelDown,
    /// The channel exhausted its reconnect budget; no traffic is accepted.
    #[error("serial channel permanently unavailable")]
    ChannelUnavailable,
    /// `connect()` has not succeeded yet.
    #[error("multiplexer not connected")]
    NotConnected,
    /// The serialized command exceeded the wire-size ceiling.
    #[error("command exceeds wire size limit")]
    TooLarge,
}

struct InFlight {
    deadline: tokio::time::Instant,
    tx: oneshot::Sender<Result<Response, RpcError>>,
}

#[derive(Default)]
struct Table {
    entries: std::collections::HashMap<u32, InFlight>,
    tokens: wire::TokenAllocator,
}

struct DeviceState {
    device: Device,
    crc: bool,
    table: Mutex<Table>,
    writer: tokio::sync::Mutex<Option<WriteHalf<DynSerial>>>,
    /// Cleared once the reconnect budget is exhausted.
    available: AtomicBool,
    reconnecting: AtomicBool,
}

struct Shared {
    devices: [DeviceState; Device::COUNT],
    opener: Arc<dyn PortOpener>,
    monitor: Arc<ErrorMonitor>,
    heartbeats: Arc<HeartbeatRegistry>,
    cancel: CancellationToken,
    connected: AtomicBool,
    timer_started: AtomicBool,
    connect_gate: tokio::sync::Mutex<()>,
}

/// Awaitable handle for one dispatched command.
#[derive(Debug)]
pub struct Pending {
    device: Device,
    token: u32,
    sent_at: Instant,
    rx: oneshot::Receiver<Result<Response, RpcError>>,
}

impl Pending {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// Resolve to the command's terminal outcome.
    pub async fn wait(self) -> Result<Response, RpcError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without signalling; only possible if the mux
            // itself was torn down.
            Err(_) => Err(RpcError::ChannelDown),
        }
    }
}

/// The request/response multiplexer over all peripheral channels.
pub struct RpcMux {
    shared: Arc<Shared>,
}

fn reader_name(device: Device) -> &'static str {
    match device {
        Device::PowerSupply => "reader:psu",
        Device::PulseGen => "reader:pulsegen",
        Device::Pump => "reader:pump",
    }
}

fn origin(device: Device) -> &'static str {
    match device {
        Device::PowerSupply => "rpc:psu",
        Device::PulseGen => "rpc:pulsegen",
        Device::Pump => "rpc:pump",
    }
}

impl RpcMux {
    /// `crc` selects per-device whether frames carry checksums (negotiated
    /// from configuration at connect time).
    pub fn new(
        opener: Arc<dyn PortOpener>,
        monitor: Arc<ErrorMonitor>,
        heartbeats: Arc<HeartbeatRegistry>,
        crc: [bool; Device::COUNT],
    ) -> Self {
        let devices = Device::ALL.map(|device| DeviceState {
            device,
            crc: crc[device.index()],
            table: Mutex::new(Table::default()),
            writer: tokio::sync::Mutex::new(None),
            available: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
        });
        Self {
            shared: Arc::new(Shared {
                devices,
                opener,
                monitor,
                heartbeats,
                cancel: CancellationToken::new(),
                connected: AtomicBool::new(false),
                timer_started: AtomicBool::new(false),
                connect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Open every channel. On any failure the already-opened channels are
    /// closed and the error names the device. Idempotent: calling again
    /// after success is a no-op.
    pub async fn connect(&self) -> Result<(), ControlError> {
        let shared = &self.shared;
        let _gate = shared.connect_gate.lock().await;
        if shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut opened: Vec<(Device, DynSerial)> = Vec::with_capacity(Device::COUNT);
        for device in Device::ALL {
            match shared.opener.open(device).await {
                Ok(port) => opened.push((device, port)),
                Err(err) => {
                    // Drop closes the channels opened so far.
                    drop(opened);
                    return Err(ControlError::DeviceUnavailable {
                        device,
                        reason: format!("{:#}", err),
                    });
                }
            }
        }

        for (device, mut port) in opened {
            let discarded = channel::drain_stale(&mut port, DRAIN_WINDOW).await;
            if discarded > 0 {
                tracing::debug!(device = %device, bytes = discarded, "discarded stale serial data");
            }
            Shared::install_channel(shared, device, port).await;
        }

        if !shared.timer_started.swap(true, Ordering::AcqRel) {
            let timer_shared = shared.clone();
            tokio::spawn(async move { Shared::timer_loop(timer_shared).await });
        }

        shared.connected.store(true, Ordering::Release);
        tracing::info!("all serial channels connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether the device's channel is still accepting traffic (i.e. has
    /// not exhausted its reconnect budget).
    pub fn available(&self, device: Device) -> bool {
        self.shared.devices[device.index()]
            .available
            .load(Ordering::Acquire)
    }

    /// Dispatch a command. `deadline` is absolute; a deadline already in
    /// the past resolves as `Timeout` on the next timer tick.
    pub async fn send(
        &self,
        device: Device,
        opcode: Opcode,
        args: &[f64],
        deadline: tokio::time::Instant,
    ) -> Result<Pending, RpcError> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::Acquire) {
            return Err(RpcError::NotConnected);
        }
        let state = &shared.devices[device.index()];
        if !state.available.load(Ordering::Acquire) {
            return Err(RpcError::ChannelUnavailable);
        }

        let (tx, rx) = oneshot::channel();
        let token = {
            let mut table = state.table.lock().expect("in-flight table poisoned");
            let Table { entries, tokens } = &mut *table;
            let token = tokens.allocate(|t| entries.contains_key(&t));
            entries.insert(token, InFlight { deadline, tx });
            token
        };

        let command = Command::new(device, token, opcode, args);
        let frame = command.to_wire(state.crc);
        if frame.len() > wire::MAX_WIRE_BYTES {
            Self::forget_entry(state, token);
            return Err(RpcError::TooLarge);
        }

        {
            let mut writer = state.writer.lock().await;
            let Some(port) = writer.as_mut() else {
                Self::forget_entry(state, token);
                return Err(RpcError::ChannelDown);
            };
            if let Err(err) = port.write_all(frame.as_bytes()).await {
                *writer = None;
                drop(writer);
                Self::forget_entry(state, token);
                shared.monitor.notify(Fault::new(
                    FaultKind::SerialIo,
                    origin(device),
                    &format!("write failed on {}: {}", device, err),
                ));
                Shared::trigger_reconnect(shared, device);
                return Err(RpcError::ChannelDown);
            }
        }

        tracing::trace!(device = %device, token, opcode = %opcode, "command dispatched");
        Ok(Pending {
            device,
            token,
            sent_at: command.issued_at,
            rx,
        })
    }

    /// Cancel every in-flight request for one device; each waiter resolves
    /// with [`RpcError::Cancelled`].
    pub fn abort_in_flight(&self, device: Device) {
        Shared::fail_all(&self.shared, device, RpcError::Cancelled);
    }

    /// Abort all in-flight requests and close all channels.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.cancel.cancel();
        shared.connected.store(false, Ordering::Release);
        for device in Device::ALL {
            Shared::fail_all(shared, device, RpcError::Cancelled);
            let mut writer = shared.devices[device.index()].writer.lock().await;
            *writer = None;
        }
        tracing::info!("serial multiplexer shut down");
    }

    /// One fresh open attempt per permanently-failed channel, used by the
    /// coordinator's reinit pass. Returns `true` when every channel is
    /// available afterwards.
    pub async fn revive(&self) -> bool {
        let shared = &self.shared;
        for device in Device::ALL {
            let state = &shared.devices[device.index()];
            if state.available.load(Ordering::Acquire) {
                continue;
            }
            match shared.opener.open(device).await {
                Ok(mut port) => {
                    channel::drain_stale(&mut port, DRAIN_WINDOW).await;
                    state.available.store(true, Ordering::Release);
                    Shared::install_channel(shared, device, port).await;
                    tracing::info!(device = %device, "channel revived");
                }
                Err(err) => {
                    tracing::warn!(device = %device, error = %format!("{:#}", err), "revive failed");
                }
            }
        }
        Device::ALL
            .iter()
            .all(|d| shared.devices[d.index()].available.load(Ordering::Acquire))
    }

    /// Force the reconnect path for a device whose reader has stalled.
    pub fn restart_reader(&self, device: Device) {
        Shared::trigger_reconnect(&self.shared, device);
    }

    #[cfg(test)]
    fn in_flight_count(&self, device: Device) -> usize {
        self.shared.devices[device.index()]
            .table
            .lock()
            .expect("in-flight table poisoned")
            .entries
            .len()
    }

    fn forget_entry(state: &DeviceState, token: u32) {
        let mut table = state.table.lock().expect("in-flight table poisoned");
        table.entries.remove(&token);
        table.tokens.retire(token);
    }
}

impl Shared {
    async fn install_channel(shared: &Arc<Shared>, device: Device, port: DynSerial) {
        let (read_half, write_half) = tokio::io::split(port);
        {
            let mut writer = shared.devices[device.index()].writer.lock().await;
            *writer = Some(write_half);
        }
        let reader_shared = shared.clone();
        tokio::spawn(async move { Shared::reader_loop(reader_shared, device, read_half).await });
    }

    async fn reader_loop(shared: Arc<Shared>, device: Device, read_half: ReadHalf<DynSerial>) {
        let beat = shared.heartbeats.register(reader_name(device), true);
        let (mut line_tx, mut line_rx) =
            data::channel::<String>(LINE_RING, OverflowPolicy::DropNewest);
        let mut reader = BufReader::new(read_half);
        let mut buf: Vec<u8> = Vec::with_capacity(wire::MAX_WIRE_BYTES + 16);
        let mut reported_drops: u64 = 0;

        loop {
            if shared.cancel.is_cancelled() {
                return;
            }
            beat.beat();
            match tokio::time::timeout(READ_POLL, reader.read_until(b'\n', &mut buf)).await {
                // Poll window elapsed; any partial line stays in `buf`.
                Err(_) => continue,
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    if buf.ends_with(b"\n") {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        buf.clear();
                        if !line_tx.try_push(line) && line_tx.dropped() > reported_drops {
                            reported_drops = line_tx.dropped();
                            tracing::warn!(device = %device, dropped = reported_drops, "inbound line queue overflow");
                        }
                        while let Some(line) = line_rx.try_pop() {
                            Shared::dispatch_line(&shared, device, &line);
                        }
                    } else if buf.len() > wire::MAX_WIRE_BYTES {
                        shared.monitor.notify(Fault::new(
                            FaultKind::SerialCrc,
                            origin(device),
                            &format!("unterminated frame on {}", device),
                        ));
                        buf.clear();
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(device = %device, error = %err, "serial read error");
                    break;
                }
            }
        }

        if shared.cancel.is_cancelled() {
            return;
        }
        Shared::fail_all(&shared, device, RpcError::ChannelDown);
        shared.monitor.notify(Fault::new(
            FaultKind::SerialIo,
            origin(device),
            &format!("serial channel lost on {}", device),
        ));
        Shared::trigger_reconnect(&shared, device);
    }

    fn dispatch_line(shared: &Arc<Shared>, device: Device, line: &str) {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return;
        }
        let state = &shared.devices[device.index()];
        match wire::parse_response(trimmed, state.crc) {
            Ok(response) => {
                let waiter = {
                    let mut table = state.table.lock().expect("in-flight table poisoned");
                    let entry = table.entries.remove(&response.token);
                    if entry.is_some() {
                        table.tokens.retire(response.token);
                    }
                    entry
                };
                match waiter {
                    Some(entry) => {
                        let _ = entry.tx.send(Ok(response));
                    }
                    None => {
                        tracing::debug!(device = %device, token = response.token, "response with no in-flight entry");
                    }
                }
            }
            Err(err) => {
                shared.monitor.notify(Fault::new(
                    FaultKind::SerialCrc,
                    origin(device),
                    &format!("dropped frame on {}: {}", device, err),
                ));
            }
        }
    }

    async fn timer_loop(shared: Arc<Shared>) {
        let mut tick = tokio::time::interval(TIMER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let now = tokio::time::Instant::now();
            for device in Device::ALL {
                let state = &shared.devices[device.index()];
                let expired: Vec<(u32, InFlight)> = {
                    let mut table = state.table.lock().expect("in-flight table poisoned");
                    let tokens: Vec<u32> = table
                        .entries
                        .iter()
                        .filter(|(_, e)| e.deadline <= now)
                        .map(|(t, _)| *t)
                        .collect();
                    tokens
                        .into_iter()
                        .filter_map(|t| {
                            table.tokens.retire(t);
                            table.entries.remove(&t).map(|e| (t, e))
                        })
                        .collect()
                };
                for (token, entry) in expired {
                    tracing::debug!(device = %device, token, "command deadline elapsed");
                    let _ = entry.tx.send(Err(RpcError::Timeout));
                    shared.monitor.notify(Fault::new(
                        FaultKind::SerialTimeout,
                        origin(device),
                        &format!("command timeout on {}", device),
                    ));
                }
            }
        }
    }

    fn fail_all(shared: &Arc<Shared>, device: Device, error: RpcError) {
        let state = &shared.devices[device.index()];
        let drained: Vec<InFlight> = {
            let mut table = state.table.lock().expect("in-flight table poisoned");
            let tokens: Vec<u32> = table.entries.keys().copied().collect();
            tokens
                .into_iter()
                .filter_map(|t| {
                    table.tokens.retire(t);
                    table.entries.remove(&t)
                })
                .collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(error));
        }
    }

    fn trigger_reconnect(shared: &Arc<Shared>, device: Device) {
        if shared.cancel.is_cancelled() {
            return;
        }
        let state = &shared.devices[device.index()];
        if !state.available.load(Ordering::Acquire) {
            return;
        }
        if state.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let task_shared = shared.clone();
        tokio::spawn(async move { Shared::reconnect_loop(task_shared, device).await });
    }

    async fn reconnect_loop(shared: Arc<Shared>, device: Device) {
        let state = &shared.devices[device.index()];
        let started = tokio::time::Instant::now();
        let mut delay = INITIAL_BACKOFF;

        loop {
            if shared.cancel.is_cancelled() {
                state.reconnecting.store(false, Ordering::Release);
                return;
            }
            let elapsed = started.elapsed();
            let Some(remaining) = RECONNECT_BUDGET.checked_sub(elapsed) else {
                Shared::permanent_failure(&shared, device);
                return;
            };
            tokio::time::sleep(delay.min(remaining)).await;

            match shared.opener.open(device).await {
                Ok(mut port) => {
                    channel::drain_stale(&mut port, DRAIN_WINDOW).await;
                    Shared::install_channel(&shared, device, port).await;
                    state.reconnecting.store(false, Ordering::Release);
                    tracing::info!(device = %device, after = ?started.elapsed(), "serial channel reconnected");
                    return;
                }
                Err(err) => {
                    tracing::debug!(device = %device, error = %format!("{:#}", err), "reconnect attempt failed");
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn permanent_failure(shared: &Arc<Shared>, device: Device) {
        let state = &shared.devices[device.index()];
        state.available.store(false, Ordering::Release);
        state.reconnecting.store(false, Ordering::Release);
        // No reader exists any more; stop supervising its heartbeat until a
        // revive pass re-registers one.
        shared.heartbeats.unregister(reader_name(device));
        Shared::fail_all(shared, device, RpcError::ChannelUnavailable);
        shared.monitor.notify(Fault::new(
            FaultKind::SerialIo,
            origin(device),
            &format!("serial channel permanently failed on {}", device),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Hands out pre-built duplex ends, one per `open()` call, so tests can
    /// drive the peripheral side of each channel.
    struct DuplexOpener {
        ends: Mutex<HashMap<Device, Vec<DynSerial>>>,
        opens: std::sync::atomic::AtomicUsize,
    }

    impl DuplexOpener {
        fn new() -> (Arc<Self>, HashMap<Device, DuplexStream>) {
            let mut ends: HashMap<Device, Vec<DynSerial>> = HashMap::new();
            let mut hosts = HashMap::new();
            for device in Device::ALL {
                let (host, peripheral) = tokio::io::duplex(1024);
                ends.insert(device, vec![Box::new(peripheral) as DynSerial]);
                hosts.insert(device, host);
            }
            (
                Arc::new(Self {
                    ends: Mutex::new(ends),
                    opens: std::sync::atomic::AtomicUsize::new(0),
                }),
                hosts,
            )
        }

        fn preload(&self, device: Device, end: DynSerial) {
            self.ends
                .lock()
                .unwrap()
                .entry(device)
                .or_default()
                .push(end);
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PortOpener for DuplexOpener {
        async fn open(&self, device: Device) -> anyhow::Result<DynSerial> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.ends
                .lock()
                .unwrap()
                .get_mut(&device)
                .and_then(|v| (!v.is_empty()).then(|| v.remove(0)))
                .ok_or_else(|| anyhow::anyhow!("no channel available for {}", device))
        }
    }

    async fn connected_mux() -> (RpcMux, HashMap<Device, DuplexStream>, Arc<ErrorMonitor>) {
        let (opener, hosts) = DuplexOpener::new();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mux = RpcMux::new(opener, monitor.clone(), heartbeats, [false; Device::COUNT]);
        mux.connect().await.expect("connect");
        (mux, hosts, monitor)
    }

    async fn read_frame(host: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            host.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n") {
                return String::from_utf8(buf).unwrap();
            }
        }
    }

    fn soon(ms: u64) -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn send_matches_response_by_token() {
        let (mux, mut hosts, _monitor) = connected_mux().await;
        let pending = mux
            .send(Device::PowerSupply, Opcode::Enable, &[], soon(1000))
            .await
            .unwrap();
        let token = pending.token();

        let host = hosts.get_mut(&Device::PowerSupply).unwrap();
        let frame = read_frame(host).await;
        assert_eq!(frame, format!("{} EN\r\n", token));

        host.write_all(format!("{} OK 12.000\r\n", token).as_bytes())
            .await
            .unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(response.token, token);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.payload, Some(12.0));
        assert_eq!(mux.in_flight_count(Device::PowerSupply), 0);
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let (mux, _hosts, monitor) = connected_mux().await;
        let started = Instant::now();
        let pending = mux
            .send(Device::Pump, Opcode::Run, &[], soon(50))
            .await
            .unwrap();
        assert_eq!(pending.wait().await, Err(RpcError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert!(started.elapsed() < Duration::from_secs(2));
        let kinds: Vec<_> = monitor.drain().into_iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FaultKind::SerialTimeout));
    }

    #[tokio::test]
    async fn past_deadline_expires_immediately() {
        let (mux, _hosts, _monitor) = connected_mux().await;
        let pending = mux
            .send(Device::Pump, Opcode::Stop, &[], tokio::time::Instant::now())
            .await
            .unwrap();
        assert_eq!(pending.wait().await, Err(RpcError::Timeout));
    }

    #[tokio::test]
    async fn abort_cancels_waiters() {
        let (mux, _hosts, _monitor) = connected_mux().await;
        let pending = mux
            .send(Device::PulseGen, Opcode::Fire, &[], soon(5_000))
            .await
            .unwrap();
        mux.abort_in_flight(Device::PulseGen);
        assert_eq!(pending.wait().await, Err(RpcError::Cancelled));
        assert_eq!(mux.in_flight_count(Device::PulseGen), 0);
    }

    #[tokio::test]
    async fn stray_token_is_ignored_and_real_reply_still_matches() {
        let (mux, mut hosts, _monitor) = connected_mux().await;
        let pending = mux
            .send(Device::PowerSupply, Opcode::ReadVoltage, &[], soon(1000))
            .await
            .unwrap();
        let token = pending.token();
        let host = hosts.get_mut(&Device::PowerSupply).unwrap();
        read_frame(host).await;

        host.write_all(b"999999 OK\r\n").await.unwrap();
        host.write_all(format!("{} OK 11.900\r\n", token).as_bytes())
            .await
            .unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(response.payload, Some(11.9));
    }

    #[tokio::test]
    async fn malformed_line_reports_crc_fault() {
        let (mux, mut hosts, monitor) = connected_mux().await;
        let pending = mux
            .send(Device::PulseGen, Opcode::Arm, &[], soon(1000))
            .await
            .unwrap();
        let token = pending.token();
        let host = hosts.get_mut(&Device::PulseGen).unwrap();
        read_frame(host).await;

        host.write_all(b"not a frame at all\r\n").await.unwrap();
        host.write_all(format!("{} OK\r\n", token).as_bytes())
            .await
            .unwrap();

        pending.wait().await.unwrap();
        let kinds: Vec<_> = monitor.drain().into_iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FaultKind::SerialCrc));
    }

    #[tokio::test]
    async fn tokens_unique_across_simultaneous_in_flight() {
        let (mux, _hosts, _monitor) = connected_mux().await;
        let mut tokens = std::collections::HashSet::new();
        let mut pendings = Vec::new();
        for _ in 0..16 {
            let p = mux
                .send(Device::Pump, Opcode::SetFlowRate, &[1.0], soon(5_000))
                .await
                .unwrap();
            assert!(tokens.insert(p.token()), "token reused while in flight");
            pendings.push(p);
        }
        mux.abort_in_flight(Device::Pump);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (opener, _hosts) = DuplexOpener::new();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mux = RpcMux::new(
            opener.clone(),
            monitor,
            heartbeats,
            [false; Device::COUNT],
        );
        mux.connect().await.unwrap();
        let opens = opener.open_count();
        mux.connect().await.unwrap();
        mux.connect().await.unwrap();
        assert_eq!(opener.open_count(), opens);
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let (opener, _hosts) = DuplexOpener::new();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mux = RpcMux::new(opener, monitor, heartbeats, [false; Device::COUNT]);
        let err = mux
            .send(Device::Pump, Opcode::Run, &[], soon(100))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NotConnected);
    }

    #[tokio::test]
    async fn crc_channel_frames_carry_checksum() {
        let (opener, mut hosts) = DuplexOpener::new();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mux = RpcMux::new(opener, monitor, heartbeats, [true; Device::COUNT]);
        mux.connect().await.unwrap();

        let pending = mux
            .send(Device::PowerSupply, Opcode::Enable, &[], soon(1000))
            .await
            .unwrap();
        let host = hosts.get_mut(&Device::PowerSupply).unwrap();
        let frame = read_frame(host).await;
        assert!(frame.contains(" *"), "frame should carry a crc: {frame}");

        // Reply must carry a valid CRC too.
        let body = format!("{} OK", pending.token());
        let reply = format!("{} *{:04x}\r\n", body, wire::crc16(body.as_bytes()));
        host.write_all(reply.as_bytes()).await.unwrap();
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_loss_fails_in_flight_then_goes_permanent() {
        let (opener, mut hosts) = DuplexOpener::new();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mux = RpcMux::new(
            opener.clone(),
            monitor.clone(),
            heartbeats,
            [false; Device::COUNT],
        );
        mux.connect().await.unwrap();

        let pending = mux
            .send(Device::PowerSupply, Opcode::Enable, &[], soon(60_000))
            .await
            .unwrap();

        // Unplug: drop the host end so the reader sees EOF.
        drop(hosts.remove(&Device::PowerSupply));

        assert_eq!(pending.wait().await, Err(RpcError::ChannelDown));

        // No replacement channel exists, so reconnect runs out its budget.
        tokio::time::sleep(RECONNECT_BUDGET + Duration::from_secs(1)).await;
        assert!(!mux.available(Device::PowerSupply));

        let err = mux
            .send(Device::PowerSupply, Opcode::Enable, &[], soon(100))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::ChannelUnavailable);

        let kinds: Vec<_> = monitor.drain().into_iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FaultKind::SerialIo));

        // A revive pass with a fresh channel end restores service.
        let (host, peripheral) = tokio::io::duplex(1024);
        opener.preload(Device::PowerSupply, Box::new(peripheral));
        hosts.insert(Device::PowerSupply, host);
        assert!(mux.revive().await);
        assert!(mux.available(Device::PowerSupply));
    }

    #[tokio::test]
    async fn reconnect_restores_service_within_budget() {
        let (opener, mut hosts) = DuplexOpener::new();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mux = RpcMux::new(
            opener.clone(),
            monitor,
            heartbeats,
            [false; Device::COUNT],
        );
        mux.connect().await.unwrap();

        // Preload the replacement before unplugging so the first retry wins.
        let (replacement_host, peripheral) = tokio::io::duplex(1024);
        opener.preload(Device::Pump, Box::new(peripheral));
        drop(hosts.remove(&Device::Pump));

        // Give the reader time to notice EOF and reconnect.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(mux.available(Device::Pump));

        let mut host = replacement_host;
        let pending = mux
            .send(Device::Pump, Opcode::Run, &[], soon(1000))
            .await
            .unwrap();
        let frame = read_frame(&mut host).await;
        assert!(frame.contains("RUN"));
        host.write_all(format!("{} OK\r\n", pending.token()).as_bytes())
            .await
            .unwrap();
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let (mux, _hosts, _monitor) = connected_mux().await;
        let pending = mux
            .send(Device::PulseGen, Opcode::Arm, &[], soon(60_000))
            .await
            .unwrap();
        mux.shutdown().await;
        assert_eq!(pending.wait().await, Err(RpcError::Cancelled));
        assert_eq!(
            mux.send(Device::PulseGen, Opcode::Arm, &[], soon(100))
                .await
                .unwrap_err(),
            RpcError::NotConnected
        );
    }
}
