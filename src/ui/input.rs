//! Rotary-encoder and push-button event decoding.
//!
//! A [`RawInput`] implementation samples the three input lines (encoder A,
//! encoder B, button); the [`Decoder`] turns raw samples into
//! [`InputEvent`]s:
//!
//! - quadrature rotation via the 2-bit Gray-code transition table, one
//!   event per detent (four quarter steps);
//! - `ShortPress` on release after at least 50 ms but less than the long
//!   threshold;
//! - `LongPress` the moment the hold reaches the threshold (default 1 s),
//!   while the button is still down, so an abort fires without waiting for
//!   release. A hold of exactly the threshold is a long press.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::heartbeat::BeatHandle;

/// Debounce floor: presses shorter than this are ignored.
pub const SHORT_PRESS_MIN: Duration = Duration::from_millis(50);

/// High-level front-panel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KnobLeft,
    KnobRight,
    ShortPress,
    LongPress,
}

/// One poll of the raw input lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputSample {
    pub a: bool,
    pub b: bool,
    pub button: bool,
}

/// Source of raw line samples; the gpio chip driver sits behind this.
pub trait RawInput: Send {
    fn sample(&mut self) -> std::io::Result<InputSample>;
}

/// Quarter-step direction per (previous, current) Gray state pair.
/// Index is `(prev << 2) | current`; invalid jumps contribute nothing.
const QUADRATURE: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Quarter steps per detent on the fitted encoder.
const STEPS_PER_DETENT: i8 = 4;

/// Stateful sample-to-event decoder.
pub struct Decoder {
    long_press: Duration,
    last_gray: u8,
    quarter_steps: i8,
    pressed_at: Option<Instant>,
    long_fired: bool,
}

impl Decoder {
    pub fn new(long_press: Duration) -> Self {
        Self {
            long_press,
            last_gray: 0,
            quarter_steps: 0,
            pressed_at: None,
            long_fired: false,
        }
    }

    /// Feed one sample taken at `now`; at most one rotation event and one
    /// button event can result.
    pub fn feed(&mut self, sample: InputSample, now: Instant) -> heapless::Vec<InputEvent, 2> {
        let mut events = heapless::Vec::new();

        let gray = (u8::from(sample.a) << 1) | u8::from(sample.b);
        if gray != self.last_gray {
            let direction = QUADRATURE[usize::from((self.last_gray << 2) | gray)];
            self.last_gray = gray;
            self.quarter_steps += direction;
            if self.quarter_steps >= STEPS_PER_DETENT {
                self.quarter_steps = 0;
                let _ = events.push(InputEvent::KnobRight);
            } else if self.quarter_steps <= -STEPS_PER_DETENT {
                self.quarter_steps = 0;
                let _ = events.push(InputEvent::KnobLeft);
            }
        }

        match (self.pressed_at, sample.button) {
            (None, true) => {
                self.pressed_at = Some(now);
                self.long_fired = false;
            }
            (Some(since), true) => {
                if !self.long_fired && now.duration_since(since) >= self.long_press {
                    self.long_fired = true;
                    let _ = events.push(InputEvent::LongPress);
                }
            }
            (Some(since), false) => {
                let held = now.duration_since(since);
                self.pressed_at = None;
                if !self.long_fired && held >= SHORT_PRESS_MIN && held < self.long_press {
                    let _ = events.push(InputEvent::ShortPress);
                }
                self.long_fired = false;
            }
            (None, false) => {}
        }

        events
    }
}

/// Spawn the input poller task. Events land on `events`; a full queue
/// drops the event (the operator will simply repeat the gesture).
pub fn spawn_poller(
    mut raw: Box<dyn RawInput>,
    poll: Duration,
    long_press: Duration,
    events: mpsc::Sender<InputEvent>,
    beat: BeatHandle,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = Decoder::new(long_press);
        let mut error_streak = 0u32;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            beat.beat();
            match raw.sample() {
                Ok(sample) => {
                    error_streak = 0;
                    for event in decoder.feed(sample, Instant::now()) {
                        if events.try_send(event).is_err() {
                            tracing::warn!(?event, "input queue full, event dropped");
                        }
                    }
                }
                Err(err) => {
                    error_streak += 1;
                    if error_streak == 1 {
                        tracing::warn!(error = %err, "input sampling failed");
                    }
                }
            }
            tokio::time::sleep(poll).await;
        }
    })
}
