//! Built-in reference protocol.
//!
//! The production step tables load from configuration; this module keeps
//! one canonical three-step lysis protocol in code so the engine, the
//! multiplexer, and the logger can be exercised without a config file.

use std::time::Duration;

use super::{ArgSource, CleanupStep, Protocol, StepDef, DEFAULT_RETRIES};
use crate::parameter::Parameter;
use crate::rpc::{Device, Opcode};

/// Three-step cell-lysis reference: energize the supply, fire the pulse,
/// flush the chamber. Cleanup de-energizes and stops the pump.
pub fn lysis() -> Protocol {
    let step = |name: &str, device, opcode, args: Vec<ArgSource>| StepDef {
        name: name.to_string(),
        device,
        opcode,
        args,
        deadline: Duration::from_secs(5),
        retries: DEFAULT_RETRIES,
    };

    Protocol {
        name: "lysis".to_string(),
        steps: vec![
            step(
                "prepare",
                Device::PowerSupply,
                Opcode::Enable,
                vec![ArgSource::Param(Parameter::Voltage)],
            ),
            step(
                "pulse",
                Device::PulseGen,
                Opcode::Fire,
                vec![ArgSource::Param(Parameter::PulseWidth)],
            ),
            step(
                "flush",
                Device::Pump,
                Opcode::Run,
                vec![ArgSource::Param(Parameter::FlowRate)],
            ),
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
