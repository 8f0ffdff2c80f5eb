//! Hardware module interfaces and the acquisition bus.
//!
//! Thin per-device protocol adapters exposing uniform read/command semantics
//! over a shared communication bus. The runtime state machine consumes the
//! command/state contract defined here; vendor bindings and firmware are
//! external collaborators.

pub mod bus;
pub mod bus_types;
pub mod modules;
pub mod motors;
pub mod serial;
pub mod trackers;

pub use bus::{HardwareParameters, MicrocontrollerBus, MockTransport};
pub use bus_types::{BusTransport, CommandFrame, ModuleCommand, ModuleEvent, ModuleKind, ModuleMessage};
pub use motors::{MockMotorBank, MotorBank, MotorTarget};
pub use trackers::SharedTrackers;
