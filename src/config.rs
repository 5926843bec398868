//! Typed configuration loaded from `config.json`.
//!
//! The file declares the serial port map, the protocol step table,
//! parameter defaults with bounds, storage limits, and input timing. The
//! loader deserializes with `serde` through the `config` crate and then
//! runs a semantic validation pass; the coordinator only ever sees a
//! validated [`Settings`] value. A file that fails either stage keeps the
//! daemon from booting (exit code 2).
//!
//! ## Schema sketch
//!
//! ```json
//! {
//!   "storage": { "quota_mib": 512 },
//!   "serial": {
//!     "power_supply": { "path": "/dev/ttyUSB0", "baud": 115200, "crc": false },
//!     "pulse_gen":    { "path": "/dev/ttyUSB1" },
//!     "pump":         { "path": "/dev/ttyUSB2" }
//!   },
//!   "parameters": [
//!     { "key": "voltage", "default": 12.0, "min": 0.0, "max": 48.0 }
//!   ],
//!   "protocol": {
//!     "name": "lysis",
//!     "steps": [
//!       { "name": "prepare", "device": "power_supply", "opcode": "enable",
//!         "args": ["voltage"], "deadline_ms": 5000, "retry_count": 2 }
//!     ],
//!     "abort": [
//!       { "name": "power_off", "device": "power_supply", "opcode": "disable" }
//!     ]
//!   },
//!   "input": { "poll_ms": 10, "long_press_ms": 1000 }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::parameter::{Bounds, Parameter};
use crate::protocol::{ArgSource, CleanupStep, Protocol, StepDef, DEFAULT_RETRIES};
use crate::rpc::{Device, Opcode, TtySettings};
use crate::runlog::{LoggerConfig, DEFAULT_QUOTA_BYTES};
use crate::validation::{is_finite, is_in_range, is_not_empty, is_positive};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub serial: SerialSettings,
    pub parameters: Vec<ParameterSpec>,
    pub protocol: ProtocolSettings,
    pub input: InputSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            serial: SerialSettings::default(),
            parameters: Vec::new(),
            protocol: ProtocolSettings::default(),
            input: InputSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub quota_mib: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            quota_mib: DEFAULT_QUOTA_BYTES / (1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub power_supply: PortSettings,
    pub pulse_gen: PortSettings,
    pub pump: PortSettings,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            power_supply: PortSettings::at("/dev/instrument/psu"),
            pulse_gen: PortSettings::at("/dev/instrument/pulsegen"),
            pump: PortSettings::at("/dev/instrument/pump"),
        }
    }
}

impl SerialSettings {
    pub fn port(&self, device: Device) -> &PortSettings {
        match device {
            Device::PowerSupply => &self.power_supply,
            Device::PulseGen => &self.pulse_gen,
            Device::Pump => &self.pump,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub path: String,
    pub baud: u32,
    pub crc: bool,
}

impl PortSettings {
    fn at(path: &str) -> Self {
        Self {
            path: path.to_string(),
            baud: 115_200,
            crc: false,
        }
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self::at("")
    }
}

/// One parameter's default value and validation bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub key: Parameter,
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub name: String,
    pub steps: Vec<StepSettings>,
    pub abort: Vec<CleanupSettings>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            steps: Vec::new(),
            abort: Vec::new(),
        }
    }
}

/// A step argument: a parameter name (string) or a numeric literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    Param(Parameter),
    Literal(f64),
}

impl ArgSpec {
    fn to_source(&self) -> ArgSource {
        match self {
            ArgSpec::Param(key) => ArgSource::Param(*key),
            ArgSpec::Literal(value) => ArgSource::Literal(*value),
        }
    }
}

fn default_step_deadline_ms() -> u64 {
    5_000
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRIES
}

fn default_cleanup_deadline_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSettings {
    pub name: String,
    pub device: Device,
    pub opcode: Opcode,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default = "default_step_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSettings {
    pub name: String,
    pub device: Device,
    pub opcode: Opcode,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default = "default_cleanup_deadline_ms")]
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub poll_ms: u64,
    pub long_press_ms: u64,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            poll_ms: 10,
            long_press_ms: 1_000,
        }
    }
}

impl Settings {
    /// Load and validate `config.json`.
    pub fn load(path: &Path) -> Result<Self, ControlError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ControlError> {
        is_positive("storage.quota_mib", self.storage.quota_mib)?;

        for device in Device::ALL {
            let port = self.serial.port(device);
            is_not_empty(&format!("serial.{}.path", device), &port.path)?;
            is_positive(&format!("serial.{}.baud", device), u64::from(port.baud))?;
        }

        let mut seen_params = HashSet::new();
        for spec in &self.parameters {
            let field = format!("parameters.{}", spec.key);
            if !seen_params.insert(spec.key) {
                return Err(ControlError::Configuration(format!(
                    "{} declared more than once",
                    field
                )));
            }
            is_finite(&format!("{}.default", field), spec.default)?;
            is_finite(&format!("{}.min", field), spec.min)?;
            is_finite(&format!("{}.max", field), spec.max)?;
            if spec.min >= spec.max {
                return Err(ControlError::Configuration(format!(
                    "{}: min {} must be below max {}",
                    field, spec.min, spec.max
                )));
            }
            if spec.default < spec.min || spec.default > spec.max {
                return Err(ControlError::Configuration(format!(
                    "{}: default {} outside [{}, {}]",
                    field, spec.default, spec.min, spec.max
                )));
            }
        }

        is_not_empty("protocol.name", &self.protocol.name)?;
        if self.protocol.steps.is_empty() {
            return Err(ControlError::Configuration(
                "protocol.steps must declare at least one step".into(),
            ));
        }
        let mut seen_steps = HashSet::new();
        for step in &self.protocol.steps {
            is_not_empty("protocol.steps[].name", &step.name)?;
            if !seen_steps.insert(step.name.as_str()) {
                return Err(ControlError::Configuration(format!(
                    "protocol step '{}' declared more than once",
                    step.name
                )));
            }
            if !step.opcode.belongs_to(step.device) {
                return Err(ControlError::Configuration(format!(
                    "protocol step '{}': opcode {} does not belong to {}",
                    step.name, step.opcode, step.device
                )));
            }
            is_positive(&format!("protocol step '{}' deadline_ms", step.name), step.deadline_ms)?;
        }
        for cleanup in &self.protocol.abort {
            if !cleanup.opcode.belongs_to(cleanup.device) {
                return Err(ControlError::Configuration(format!(
                    "abort step '{}': opcode {} does not belong to {}",
                    cleanup.name, cleanup.opcode, cleanup.device
                )));
            }
            is_positive(
                &format!("abort step '{}' deadline_ms", cleanup.name),
                cleanup.deadline_ms,
            )?;
        }

        is_in_range("input.poll_ms", self.input.poll_ms, 1, 50)?;
        is_in_range("input.long_press_ms", self.input.long_press_ms, 200, 5_000)?;
        Ok(())
    }

    /// Build the executable protocol value from the step table.
    pub fn to_protocol(&self) -> Protocol {
        Protocol {
            name: self.protocol.name.clone(),
            steps: self
                .protocol
                .steps
                .iter()
                .map(|s| StepDef {
                    name: s.name.clone(),
                    device: s.device,
                    opcode: s.opcode,
                    args: s.args.iter().map(ArgSpec::to_source).collect(),
                    deadline: Duration::from_millis(s.deadline_ms),
                    retries: s.retry_count,
                })
                .collect(),
            abort_sequence: self
                .protocol
                .abort
                .iter()
                .map(|c| CleanupStep {
                    device: c.device,
                    opcode: c.opcode,
                    args: c.args.iter().map(ArgSpec::to_source).collect(),
                    deadline: Duration::from_millis(c.deadline_ms),
                })
                .collect(),
        }
    }

    pub fn port_map(&self) -> HashMap<Device, TtySettings> {
        Device::ALL
            .iter()
            .map(|&device| {
                let port = self.serial.port(device);
                (
                    device,
                    TtySettings {
                        path: port.path.clone(),
                        baud: port.baud,
                    },
                )
            })
            .collect()
    }

    pub fn crc_flags(&self) -> [bool; Device::COUNT] {
        [
            self.serial.power_supply.crc,
            self.serial.pulse_gen.crc,
            self.serial.pump.crc,
        ]
    }

    pub fn parameter_table(&self) -> Vec<(Parameter, Bounds, f64)> {
        self.parameters
            .iter()
            .map(|spec| {
                (
                    spec.key,
                    Bounds {
                        min: spec.min,
                        max: spec.max,
                    },
                    spec.default,
                )
            })
            .collect()
    }

    pub fn logger_config(&self, root: &Path) -> LoggerConfig {
        let mut config = LoggerConfig::new(root);
        config.quota_bytes = self.storage.quota_mib * 1024 * 1024;
        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.input.poll_ms)
    }

    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.input.long_press_ms)
    }
}

/// In-memory settings for the reference lysis protocol; used by tests and
/// by `--loopback` runs that have no config file.
pub fn reference_settings() -> Settings {
    let json = serde_json::json!({
        "storage": { "quota_mib": 64 },
        "parameters": [
            { "key": "voltage",     "default": 12.0,  "min": 0.0, "max": 48.0 },
            { "key": "pulse_width", "default": 50.0,  "min": 1.0, "max": 5000.0 },
            { "key": "flow_rate",   "default": 10.0,  "min": 0.0, "max": 500.0 }
        ],
        "protocol": {
            "name": "lysis",
            "steps": [
                { "name": "prepare", "device": "power_supply", "opcode": "enable",
                  "args": ["voltage"], "deadline_ms": 5000, "retry_count": 2 },
                { "name": "pulse", "device": "pulse_gen", "opcode": "fire",
                  "args": ["pulse_width"], "deadline_ms": 5000, "retry_count": 2 },
                { "name": "flush", "device": "pump", "opcode": "run",
                  "args": ["flow_rate"], "deadline_ms": 5000, "retry_count": 2 }
            ],
            "abort": [
                { "name": "power_off", "device": "power_supply", "opcode": "disable" },
                { "name": "pump_stop", "device": "pump", "opcode": "stop" }
            ]
        }
    });
    let settings: Settings =
        serde_json::from_value(json).expect("reference settings must deserialize");
    settings.validate().expect("reference settings must validate");
    settings
}
