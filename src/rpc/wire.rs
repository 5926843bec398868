//! Wire-level types for the peripheral RPC protocol.
//!
//! Frames are ASCII lines terminated by CR-LF:
//!
//! ```text
//! <token> <opcode> [args...] [*<crc16>]\r\n     (command)
//! <token> <status> [payload] [*<crc16>]\r\n     (response)
//! ```
//!
//! The CRC is CRC-16/CCITT-FALSE over the frame body (everything before the
//! ` *` separator), rendered as four lowercase hex digits. Whether a channel
//! carries CRCs is negotiated per device at connect time; when absent,
//! framing relies on CR-LF alone.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized commands may not exceed this many bytes on the wire.
pub const MAX_WIRE_BYTES: usize = 256;

/// Maximum argument count per command.
pub const MAX_ARGS: usize = 8;

/// The three fixed peripherals. Adding one is a deliberate edit of this
/// enum, the opcode table, and the configuration schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    PowerSupply,
    PulseGen,
    Pump,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::PowerSupply, Device::PulseGen, Device::Pump];

    pub const COUNT: usize = Self::ALL.len();

    pub fn label(&self) -> &'static str {
        match self {
            Device::PowerSupply => "psu",
            Device::PulseGen => "pulsegen",
            Device::Pump => "pump",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Closed per-device opcode sets, flattened into one enum. `belongs_to`
/// enforces the per-device partition at config-validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    // Power supply
    Enable,
    Disable,
    SetVoltage,
    ReadVoltage,
    // Pulse generator
    Arm,
    Fire,
    SetFrequency,
    Standby,
    // Syringe pump
    Run,
    Stop,
    SetFlowRate,
    Prime,
}

impl Opcode {
    /// Wire mnemonic.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Enable => "EN",
            Opcode::Disable => "DIS",
            Opcode::SetVoltage => "VSET",
            Opcode::ReadVoltage => "VREAD",
            Opcode::Arm => "ARM",
            Opcode::Fire => "FIRE",
            Opcode::SetFrequency => "FSET",
            Opcode::Standby => "STBY",
            Opcode::Run => "RUN",
            Opcode::Stop => "STOP",
            Opcode::SetFlowRate => "QSET",
            Opcode::Prime => "PRIME",
        }
    }

    pub fn belongs_to(&self, device: Device) -> bool {
        let owner = match self {
            Opcode::Enable | Opcode::Disable | Opcode::SetVoltage | Opcode::ReadVoltage => {
                Device::PowerSupply
            }
            Opcode::Arm | Opcode::Fire | Opcode::SetFrequency | Opcode::Standby => Device::PulseGen,
            Opcode::Run | Opcode::Stop | Opcode::SetFlowRate | Opcode::Prime => Device::Pump,
        };
        owner == device
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Reply status reported by a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Nack,
}

impl Status {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Error => "ERR",
            Status::Nack => "NAK",
        }
    }

    fn parse(text: &str) -> Option<Status> {
        match text {
            "OK" => Some(Status::Ok),
            "ERR" => Some(Status::Error),
            "NAK" => Some(Status::Nack),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Argument payload with a fixed inline capacity; no heap on the dispatch
/// path.
pub type Args = heapless::Vec<f64, MAX_ARGS>;

/// An immutable request addressed to exactly one device.
#[derive(Debug, Clone)]
pub struct Command {
    pub device: Device,
    pub token: u32,
    pub opcode: Opcode,
    pub args: Args,
    pub issued_at: Instant,
}

impl Command {
    pub fn new(device: Device, token: u32, opcode: Opcode, args: &[f64]) -> Self {
        let mut stored = Args::new();
        for &a in args.iter().take(MAX_ARGS) {
            let _ = stored.push(a);
        }
        Self {
            device,
            token,
            opcode,
            args: stored,
            issued_at: Instant::now(),
        }
    }

    /// Render the CR-LF terminated frame, optionally carrying a CRC.
    pub fn to_wire(&self, with_crc: bool) -> String {
        use std::fmt::Write as _;
        let mut body = String::with_capacity(48);
        let _ = write!(body, "{} {}", self.token, self.opcode.mnemonic());
        for arg in &self.args {
            let _ = write!(body, " {:.3}", arg);
        }
        if with_crc {
            let crc = crc16(body.as_bytes());
            let _ = write!(body, " *{:04x}", crc);
        }
        body.push_str("\r\n");
        body
    }
}

/// The matched reply to a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
    pub token: u32,
    pub status: Status,
    pub payload: Option<f64>,
    pub received_at: Instant,
}

/// Framing or checksum failure on an inbound line.
#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("bad token field '{0}'")]
    BadToken(String),
    #[error("unknown status '{0}'")]
    BadStatus(String),
    #[error("bad payload field '{0}'")]
    BadPayload(String),
    #[error("crc mismatch: frame carries {got:04x}, computed {want:04x}")]
    CrcMismatch { got: u16, want: u16 },
    #[error("malformed crc field")]
    BadCrc,
    #[error("crc negotiated but frame carries none")]
    CrcMissing,
}

/// Parse one inbound line (CR-LF already stripped) into a [`Response`].
///
/// When `crc_negotiated` is set, frames without a checksum are rejected.
/// Frames that carry a checksum are verified either way.
pub fn parse_response(line: &str, crc_negotiated: bool) -> Result<Response, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(FrameError::Empty);
    }

    let body = match line.rfind(" *") {
        Some(pos) => {
            let (body, crc_field) = line.split_at(pos);
            let crc_text = &crc_field[2..];
            let got = u16::from_str_radix(crc_text, 16).map_err(|_| FrameError::BadCrc)?;
            let want = crc16(body.as_bytes());
            if got != want {
                return Err(FrameError::CrcMismatch { got, want });
            }
            body
        }
        None if crc_negotiated => return Err(FrameError::CrcMissing),
        None => line,
    };

    let mut fields = body.split_whitespace();
    let token_text = fields.next().ok_or(FrameError::Empty)?;
    let token = token_text
        .parse::<u32>()
        .map_err(|_| FrameError::BadToken(token_text.to_string()))?;
    let status_text = fields
        .next()
        .ok_or_else(|| FrameError::BadStatus(String::new()))?;
    let status =
        Status::parse(status_text).ok_or_else(|| FrameError::BadStatus(status_text.to_string()))?;
    let payload = match fields.next() {
        Some(text) => Some(
            text.parse::<f64>()
                .map_err(|_| FrameError::BadPayload(text.to_string()))?,
        ),
        None => None,
    };

    Ok(Response {
        token,
        status,
        payload,
        received_at: Instant::now(),
    })
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xffff).
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Number of retired tokens remembered to avoid premature reuse while a
/// stale reply could still arrive.
const RECENT_TOKENS: usize = 256;

/// Monotonic token allocator (mod 2^32) with a recently-retired window.
pub struct TokenAllocator {
    next: u32,
    recent: std::collections::VecDeque<u32>,
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            recent: std::collections::VecDeque::with_capacity(RECENT_TOKENS),
        }
    }

    /// Hand out the next token not in flight and not recently retired.
    pub fn allocate(&mut self, in_use: impl Fn(u32) -> bool) -> u32 {
        loop {
            let token = self.next;
            self.next = self.next.wrapping_add(1).max(1);
            if !self.recent.contains(&token) && !in_use(token) {
                return token;
            }
        }
    }

    /// Record a token leaving the in-flight table.
    pub fn retire(&mut self, token: u32) {
        if self.recent.len() == RECENT_TOKENS {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }
}
