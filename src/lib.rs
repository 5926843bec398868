//! # instrumentd core library
//!
//! This crate is the control-plane core of a benchtop medical instrument
//! running on an embedded Linux MPU. It supervises three microcontroller
//! peripherals (programmable power supply, pulse generator, syringe pump)
//! over USB-serial, executes parameterized experiment protocols, accepts
//! operator input from a rotary encoder, renders status to a small panel,
//! and records every run to removable storage.
//!
//! ## Crate structure
//!
//! - **`config`**: Typed settings loaded from `config.json`, including the
//!   protocol step table and parameter bounds. Validated before the
//!   coordinator ever sees them.
//! - **`coordinator`**: The [`coordinator::SystemCoordinator`] lifecycle
//!   state machine. Owns every other subsystem, drains fault escalations,
//!   supervises heartbeats, and services operator input.
//! - **`data`**: Preallocated single-producer/single-consumer queues used
//!   for log events, fault escalation, and inbound serial lines.
//! - **`error`**: The [`error::ControlError`] enum and the [`error::Fault`]
//!   notification type shared by all subsystems.
//! - **`monitor`**: The [`monitor::ErrorMonitor`] fault aggregator with
//!   time-windowed deduplication and a supervisor-drained escalation queue.
//! - **`parameter`**: The mutex-guarded [`parameter::ParameterStore`] shared
//!   between the operator input task and the protocol engine.
//! - **`protocol`**: Data-driven experiment protocols and the
//!   [`protocol::ProtocolEngine`] that executes one run.
//! - **`rpc`**: The serial RPC multiplexer: per-device reader tasks,
//!   correlation-token matching, deadline expiry, and reconnect policy.
//! - **`runlog`**: The asynchronous CSV run logger with storage-quota
//!   rotation.
//! - **`ui`**: Rotary-encoder/push-button event decoding and the status
//!   panel rendering.
//!
//! The daemon binary (`main.rs`) wires these together, installs signal
//! handlers, and maps boot failures to exit codes.

pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod heartbeat;
pub mod monitor;
pub mod parameter;
pub mod protocol;
pub mod rpc;
pub mod runlog;
pub mod ui;
mod validation;

pub use coordinator::{SystemCoordinator, SystemState};
pub use error::{ControlError, Fault, FaultKind};
pub use monitor::ErrorMonitor;
pub use parameter::{Parameter, ParameterStore};
pub use rpc::{Device, RpcMux};
pub use runlog::{RunId, RunLogger};
