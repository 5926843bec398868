//! Operator surface: rotary encoder input and the status panel.
//!
//! The gpio chip driver and the display's pixel protocol live outside this
//! crate; [`input::RawInput`] and [`display::StatusPanel`] are the seams.
//! This module owns everything above those seams: quadrature decoding,
//! press classification, the input poller task, and screen composition.

pub mod display;
pub mod input;

pub use display::{Screen, StatusPanel, TextPanel};
pub use input::{InputEvent, InputSample, RawInput};
