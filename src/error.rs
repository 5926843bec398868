//! Error and fault types shared across the daemon.
//!
//! Two distinct notions live here:
//!
//! - [`ControlError`]: the `Result` error type for fallible operations.
//!   Callers propagate it with `?`; the binary maps boot-time variants to
//!   process exit codes.
//! - [`Fault`]: a structured notification that something went wrong in a
//!   background task. Faults are not `Err` returns; they flow through the
//!   [`crate::monitor::ErrorMonitor`] queue to the coordinator, which decides
//!   whether to escalate.
//!
//! Fault messages use a fixed-capacity inline buffer so reporting a fault on
//! the serial or logging hot path never allocates. Oversize messages are
//! truncated with a trailing `~` marker.

use std::time::Instant;

use thiserror::Error;

use crate::rpc::Device;

/// Maximum stored length of a fault or log message.
pub const MSG_CAP: usize = 128;

/// Inline message buffer used by faults and log events.
pub type Msg = heapless::String<MSG_CAP>;

/// Build a bounded message, truncating at a character boundary and marking
/// the truncation with `~`.
pub fn bounded_msg(text: &str) -> Msg {
    let mut out = Msg::new();
    if text.len() <= MSG_CAP {
        // Always fits; heapless push_str only fails on overflow.
        let _ = out.push_str(text);
        return out;
    }
    let mut end = MSG_CAP - 1;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let _ = out.push_str(&text[..end]);
    let _ = out.push('~');
    out
}

/// Closed set of fault categories. The coordinator's escalation policy is
/// keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Serial channel I/O failure (EOF, write error, unrecoverable read).
    SerialIo,
    /// An in-flight command's deadline elapsed.
    SerialTimeout,
    /// Inbound frame failed CRC or token parsing; the line was dropped.
    SerialCrc,
    /// The log storage root is absent or cannot be opened.
    StorageMissing,
    /// The log storage quota was reached; oldest runs were rotated out.
    StorageFull,
    /// Configuration failed validation.
    ConfigInvalid,
    /// A protocol run entered its abort path.
    ProtocolAbort,
    /// A supervised task stopped publishing heartbeats.
    ThreadStall,
    /// The status panel rejected a render.
    DisplayIo,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultKind::SerialIo => "serial_io",
            FaultKind::SerialTimeout => "serial_timeout",
            FaultKind::SerialCrc => "serial_crc",
            FaultKind::StorageMissing => "storage_missing",
            FaultKind::StorageFull => "storage_full",
            FaultKind::ConfigInvalid => "config_invalid",
            FaultKind::ProtocolAbort => "protocol_abort",
            FaultKind::ThreadStall => "thread_stall",
            FaultKind::DisplayIo => "display_io",
        };
        write!(f, "{}", label)
    }
}

/// A structured fault notification.
///
/// `origin` names the reporting task (`"reader:psu"`, `"runlog"`, ...);
/// `at` is the monotonic report time used by the dedup window.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: Msg,
    pub origin: &'static str,
    pub at: Instant,
}

impl Fault {
    pub fn new(kind: FaultKind, origin: &'static str, message: &str) -> Self {
        Self {
            kind,
            message: bounded_msg(message),
            origin,
            at: Instant::now(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} ({})", self.kind, self.message, self.origin)
    }
}

/// Primary error type for the control core.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("configuration validation error: {0}")]
    Configuration(String),

    /// Underlying file or device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A required serial device could not be opened at connect time.
    /// Post-connect dispatch failures surface as
    /// [`crate::rpc::RpcError`] instead.
    #[error("serial device {device} unavailable: {reason}")]
    DeviceUnavailable { device: Device, reason: String },

    /// The storage root for run logs is unusable.
    #[error("run-log storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A parameter write was rejected by its declared bounds.
    #[error("value {value} for {parameter} outside [{min}, {max}]")]
    OutOfRange {
        parameter: crate::parameter::Parameter,
        value: f64,
        min: f64,
        max: f64,
    },
}
