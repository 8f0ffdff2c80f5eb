//! Shared types of the microcontroller bus contract.
//!
//! Every hardware module is addressed by a [`ModuleKind`] and spoken to
//! through the same command/event vocabulary, so the state machine can treat
//! all modules polymorphically regardless of the underlying device. The
//! actual wire protocol (microcontroller firmware) is an external
//! collaborator; transports only need to move these frames.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};

/// Address of a hardware module on the acquisition bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Solenoid water valve plus its piezo buzzer.
    Valve,
    /// Capacitive lick sensor.
    Lick,
    /// Wheel break.
    Break,
    /// Wheel rotary encoder.
    Encoder,
    /// Wheel torque sensor.
    Torque,
    /// VR display power toggle.
    Screens,
    /// Imaging-device TTL trigger and frame-pulse monitor.
    FrameTtl,
}

impl ModuleKind {
    /// Stable one-byte type code used on the wire and in log file names.
    pub fn type_code(&self) -> u8 {
        match self {
            ModuleKind::Valve => 101,
            ModuleKind::Lick => 152,
            ModuleKind::Break => 102,
            ModuleKind::Encoder => 203,
            ModuleKind::Torque => 153,
            ModuleKind::Screens => 103,
            ModuleKind::FrameTtl => 154,
        }
    }

    /// Resolves a wire type code back to a module address.
    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            101 => Some(ModuleKind::Valve),
            152 => Some(ModuleKind::Lick),
            102 => Some(ModuleKind::Break),
            203 => Some(ModuleKind::Encoder),
            153 => Some(ModuleKind::Torque),
            103 => Some(ModuleKind::Screens),
            154 => Some(ModuleKind::FrameTtl),
            _ => None,
        }
    }
}

/// Command sent to a hardware module.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleCommand {
    /// Start the module's monitoring/reporting loop.
    Enable,
    /// Stop the module's monitoring/reporting loop.
    Disable,
    /// Drive a binary output (break engage, screen power).
    Toggle { on: bool },
    /// Open the valve (or raise a TTL line) for a fixed duration.
    SendPulse { duration_us: u32 },
    /// Sound the buzzer without opening the valve.
    Tone { duration_ms: u32 },
    /// Raise the imaging start-acquisition TTL line.
    StartAcquisition,
    /// Raise the imaging stop-acquisition TTL line.
    StopAcquisition,
}

/// One addressed command frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub module: ModuleKind,
    pub command: ModuleCommand,
}

/// Event reported by a hardware module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModuleEvent {
    /// Valve transitioned to open.
    ValveOpened,
    /// Valve transitioned to closed.
    ValveClosed,
    /// Lick sensor crossed a voltage level (raw ADC units).
    LickLevel { adc: u16 },
    /// Encoder accumulated a signed pulse delta since the last report.
    EncoderDelta { pulses: i32 },
    /// Torque sensor reading (raw ADC units, sign encodes direction).
    TorqueReading { adc: i16 },
    /// Imaging device emitted a frame-acquired pulse.
    FramePulse,
    /// Screen power state changed.
    ScreenToggled { on: bool },
}

/// One event message received from the bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleMessage {
    pub module: ModuleKind,
    pub event: ModuleEvent,
}

/// Transport moving command frames out and event messages in.
///
/// `try_receive` must never block: the runtime control loop drains the
/// transport once per cycle and its per-cycle cost has to stay bounded.
pub trait BusTransport: Send {
    /// Establishes the hardware connection.
    fn connect(&mut self) -> AppResult<()>;

    /// Sends one command frame.
    fn send(&mut self, frame: &CommandFrame) -> AppResult<()>;

    /// Returns the next pending event message, if any, without blocking.
    fn try_receive(&mut self) -> Option<ModuleMessage>;

    /// Releases the hardware connection.
    fn disconnect(&mut self) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_round_trip() {
        for kind in [
            ModuleKind::Valve,
            ModuleKind::Lick,
            ModuleKind::Break,
            ModuleKind::Encoder,
            ModuleKind::Torque,
            ModuleKind::Screens,
            ModuleKind::FrameTtl,
        ] {
            assert_eq!(ModuleKind::from_type_code(kind.type_code()), Some(kind));
        }
        assert_eq!(ModuleKind::from_type_code(0), None);
    }
}
