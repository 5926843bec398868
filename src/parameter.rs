//! Thread-safe store for the instrument's tunable parameters.
//!
//! The operator input task writes values here; the protocol engine reads
//! them through frozen snapshots; the run logger records every change. A
//! single mutex guards the store. Observer callbacks run on the setting
//! thread, in registration order, strictly *after* the mutex is released so
//! an observer can re-enter the store without deadlocking. Observers must
//! return quickly (well under a millisecond); that is a contract, not
//! something the store enforces.
//!
//! A value never leaves the store outside its declared bounds: `set`
//! validates before writing and returns [`ControlError::OutOfRange`] on
//! rejection. The store itself never logs; rejection is the caller's news
//! to break.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Closed set of tunable parameter keys. Adding a key is a deliberate
/// edit here, in [`Parameter::ALL`], and in the default bounds table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Temperature,
    FlowRate,
    Voltage,
    Frequency,
    SyringeDiameter,
    PulseWidth,
}

impl Parameter {
    pub const ALL: [Parameter; 6] = [
        Parameter::Temperature,
        Parameter::FlowRate,
        Parameter::Voltage,
        Parameter::Frequency,
        Parameter::SyringeDiameter,
        Parameter::PulseWidth,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn label(&self) -> &'static str {
        match self {
            Parameter::Temperature => "temperature",
            Parameter::FlowRate => "flow_rate",
            Parameter::Voltage => "voltage",
            Parameter::Frequency => "frequency",
            Parameter::SyringeDiameter => "syringe_diameter",
            Parameter::PulseWidth => "pulse_width",
        }
    }

    /// Unit shown on the panel next to the value.
    pub fn unit(&self) -> &'static str {
        match self {
            Parameter::Temperature => "C",
            Parameter::FlowRate => "uL/s",
            Parameter::Voltage => "V",
            Parameter::Frequency => "Hz",
            Parameter::SyringeDiameter => "mm",
            Parameter::PulseWidth => "us",
        }
    }

    /// Step applied per encoder detent when this parameter is selected.
    pub fn adjust_step(&self) -> f64 {
        match self {
            Parameter::Temperature => 0.5,
            Parameter::FlowRate => 1.0,
            Parameter::Voltage => 0.1,
            Parameter::Frequency => 10.0,
            Parameter::SyringeDiameter => 0.1,
            Parameter::PulseWidth => 5.0,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Inclusive validation bounds for one key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Conservative built-in bounds and defaults, used until the configuration
/// file overrides them at Init.
fn builtin(key: Parameter) -> (Bounds, f64) {
    match key {
        Parameter::Temperature => (Bounds { min: 4.0, max: 95.0 }, 25.0),
        Parameter::FlowRate => (Bounds { min: 0.0, max: 500.0 }, 10.0),
        Parameter::Voltage => (Bounds { min: 0.0, max: 48.0 }, 12.0),
        Parameter::Frequency => (Bounds { min: 1.0, max: 10_000.0 }, 100.0),
        Parameter::SyringeDiameter => (Bounds { min: 1.0, max: 30.0 }, 12.5),
        Parameter::PulseWidth => (Bounds { min: 1.0, max: 5_000.0 }, 50.0),
    }
}

/// Result of a successful `set`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetOutcome {
    /// The stored value changed; observers were notified.
    Changed { old: f64 },
    /// The new value equals the stored value; no notification was emitted.
    Unchanged,
}

/// Frozen copy of every parameter, taken at step entry so a protocol step
/// sees one consistent view across multiple reads.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    values: [f64; Parameter::COUNT],
}

impl Snapshot {
    pub fn get(&self, key: Parameter) -> f64 {
        self.values[key.index()]
    }
}

/// Change observer: `(key, old, new)`, invoked on the setting thread after
/// the store lock is released.
pub type Observer = Arc<dyn Fn(Parameter, f64, f64) + Send + Sync>;

struct Inner {
    values: [f64; Parameter::COUNT],
    bounds: [Bounds; Parameter::COUNT],
    observers: Vec<Observer>,
}

/// Mutex-guarded typed key/value store with change notification.
pub struct ParameterStore {
    inner: Mutex<Inner>,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        let mut values = [0.0; Parameter::COUNT];
        let mut bounds = [Bounds { min: 0.0, max: 0.0 }; Parameter::COUNT];
        for key in Parameter::ALL {
            let (b, default) = builtin(key);
            values[key.index()] = default;
            bounds[key.index()] = b;
        }
        Self {
            inner: Mutex::new(Inner {
                values,
                bounds,
                observers: Vec::new(),
            }),
        }
    }

    /// Install configured bounds and default for one key. The default must
    /// sit inside the bounds; the config validator guarantees this before
    /// the coordinator calls in.
    pub fn configure(&self, key: Parameter, bounds: Bounds, default: f64) {
        let mut inner = self.inner.lock().expect("parameter store poisoned");
        inner.bounds[key.index()] = bounds;
        inner.values[key.index()] = default;
    }

    pub fn get(&self, key: Parameter) -> f64 {
        let inner = self.inner.lock().expect("parameter store poisoned");
        inner.values[key.index()]
    }

    pub fn bounds(&self, key: Parameter) -> Bounds {
        let inner = self.inner.lock().expect("parameter store poisoned");
        inner.bounds[key.index()]
    }

    /// Validate and write one value. Observers run after the lock is
    /// released, only when the value actually changed.
    pub fn set(&self, key: Parameter, value: f64) -> Result<SetOutcome, ControlError> {
        let (old, observers) = {
            let mut inner = self.inner.lock().expect("parameter store poisoned");
            let bounds = inner.bounds[key.index()];
            if !value.is_finite() || !bounds.contains(value) {
                return Err(ControlError::OutOfRange {
                    parameter: key,
                    value,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
            let old = inner.values[key.index()];
            if old == value {
                return Ok(SetOutcome::Unchanged);
            }
            inner.values[key.index()] = value;
            (old, inner.observers.clone())
        };
        for observer in &observers {
            observer(key, old, value);
        }
        Ok(SetOutcome::Changed { old })
    }

    /// Clamped adjustment by `steps` encoder detents; used by the input
    /// task. Returns the outcome of the underlying `set`.
    pub fn adjust(&self, key: Parameter, steps: i32) -> Result<SetOutcome, ControlError> {
        let bounds = self.bounds(key);
        let current = self.get(key);
        let target = current + f64::from(steps) * key.adjust_step();
        self.set(key, target.clamp(bounds.min, bounds.max))
    }

    pub fn subscribe(&self, observer: Observer) {
        let mut inner = self.inner.lock().expect("parameter store poisoned");
        inner.observers.push(observer);
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().expect("parameter store poisoned");
        Snapshot {
            values: inner.values,
        }
    }
}
