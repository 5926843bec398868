//! Serial channel abstraction.
//!
//! The multiplexer never names a concrete port type: a channel is any
//! `AsyncRead + AsyncWrite` object behind [`DynSerial`]. Production opens
//! `tokio_serial` streams through [`TtyOpener`]; tests hand out
//! `tokio::io::duplex` pairs instead. Port opening goes through
//! `spawn_blocking` because termios setup can stall on a wedged USB
//! adapter.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use super::wire::Device;

/// Any async byte stream usable as a serial channel.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Type-erased boxed serial channel.
pub type DynSerial = Box<dyn SerialIo>;

/// Opens the serial channel for one device. Implemented by [`TtyOpener`]
/// for hardware and by test fixtures for loopback streams.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, device: Device) -> anyhow::Result<DynSerial>;
}

/// Per-device tty settings.
#[derive(Debug, Clone)]
pub struct TtySettings {
    pub path: String,
    pub baud: u32,
}

/// Opens `/dev/tty*` ports with 8N1 framing and no flow control.
pub struct TtyOpener {
    ports: HashMap<Device, TtySettings>,
}

impl TtyOpener {
    pub fn new(ports: HashMap<Device, TtySettings>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl PortOpener for TtyOpener {
    async fn open(&self, device: Device) -> anyhow::Result<DynSerial> {
        use tokio_serial::SerialPortBuilderExt;

        let settings = self
            .ports
            .get(&device)
            .with_context(|| format!("no serial path configured for {}", device))?
            .clone();

        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&settings.path, settings.baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .with_context(|| format!("opening {} at {}", settings.path, settings.baud))
        })
        .await
        .context("spawn_blocking for serial open failed")??;

        Ok(Box::new(stream))
    }
}

/// Loopback opener for bench-less operation and tests: every opened
/// channel is backed by a task that answers each well-formed command with
/// an `OK` reply carrying the same token.
pub struct LoopbackOpener;

#[async_trait]
impl PortOpener for LoopbackOpener {
    async fn open(&self, device: Device) -> anyhow::Result<DynSerial> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (ours, theirs) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(token) = line.split_whitespace().next() else {
                    continue;
                };
                let reply = format!("{} OK\r\n", token);
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            tracing::debug!(device = %device, "loopback peripheral closed");
        });
        Ok(Box::new(ours))
    }
}

/// Read and discard whatever the peripheral buffered while we were away.
/// Returns the number of discarded bytes. Called once per (re)connect so a
/// half-transmitted reply from a previous life cannot match a fresh token.
pub async fn drain_stale<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }
    total
}
