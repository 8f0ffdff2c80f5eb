//! Serial transport for the acquisition microcontroller bus.
//!
//! Frames a fixed six-byte wire protocol over an RS-232/USB-CDC link:
//!
//! ```text
//! outbound: [type_code u8][command u8][value u32 LE]
//! inbound:  [type_code u8][event u8][value i32 LE]
//! ```
//!
//! The port is opened with a near-zero read timeout so `try_receive` never
//! blocks the control loop; partial frames accumulate in an internal buffer
//! across cycles.

use crate::hardware::bus_types::{
    CommandFrame, ModuleCommand, ModuleEvent, ModuleKind, ModuleMessage,
};

#[cfg(feature = "instrument_serial")]
use crate::error::{AppResult, VrError};
#[cfg(feature = "instrument_serial")]
use crate::hardware::bus_types::BusTransport;
#[cfg(feature = "instrument_serial")]
use bytes::{Buf, BytesMut};
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::Read;

const FRAME_LEN: usize = 6;
#[cfg(feature = "instrument_serial")]
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1);

// Outbound command codes.
const CMD_ENABLE: u8 = 1;
const CMD_DISABLE: u8 = 2;
const CMD_TOGGLE: u8 = 3;
const CMD_PULSE: u8 = 4;
const CMD_TONE: u8 = 5;
const CMD_START_ACQUISITION: u8 = 6;
const CMD_STOP_ACQUISITION: u8 = 7;

// Inbound event codes.
const EVT_VALVE_OPENED: u8 = 52;
const EVT_VALVE_CLOSED: u8 = 53;
const EVT_LICK_LEVEL: u8 = 60;
const EVT_ENCODER_DELTA: u8 = 61;
const EVT_TORQUE_READING: u8 = 62;
const EVT_FRAME_PULSE: u8 = 63;
const EVT_SCREEN_TOGGLED: u8 = 64;

fn encode(frame: &CommandFrame) -> [u8; FRAME_LEN] {
    let (code, value): (u8, u32) = match frame.command {
        ModuleCommand::Enable => (CMD_ENABLE, 0),
        ModuleCommand::Disable => (CMD_DISABLE, 0),
        ModuleCommand::Toggle { on } => (CMD_TOGGLE, on as u32),
        ModuleCommand::SendPulse { duration_us } => (CMD_PULSE, duration_us),
        ModuleCommand::Tone { duration_ms } => (CMD_TONE, duration_ms),
        ModuleCommand::StartAcquisition => (CMD_START_ACQUISITION, 0),
        ModuleCommand::StopAcquisition => (CMD_STOP_ACQUISITION, 0),
    };
    let mut wire = [0u8; FRAME_LEN];
    wire[0] = frame.module.type_code();
    wire[1] = code;
    wire[2..].copy_from_slice(&value.to_le_bytes());
    wire
}

fn decode(module: ModuleKind, event: u8, value: i32) -> Option<ModuleMessage> {
    let event = match event {
        EVT_VALVE_OPENED => ModuleEvent::ValveOpened,
        EVT_VALVE_CLOSED => ModuleEvent::ValveClosed,
        EVT_LICK_LEVEL => ModuleEvent::LickLevel { adc: value as u16 },
        EVT_ENCODER_DELTA => ModuleEvent::EncoderDelta { pulses: value },
        EVT_TORQUE_READING => ModuleEvent::TorqueReading { adc: value as i16 },
        EVT_FRAME_PULSE => ModuleEvent::FramePulse,
        EVT_SCREEN_TOGGLED => ModuleEvent::ScreenToggled { on: value != 0 },
        _ => return None,
    };
    Some(ModuleMessage { module, event })
}

/// Serial-port bus transport.
#[cfg(feature = "instrument_serial")]
pub struct SerialBusTransport {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    buffer: BytesMut,
}

#[cfg(feature = "instrument_serial")]
impl SerialBusTransport {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            port: None,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    fn fill_buffer(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 256];
        // A timed-out read is the normal idle case, not an error.
        match port.read(&mut chunk) {
            Ok(read) if read > 0 => self.buffer.extend_from_slice(&chunk[..read]),
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => {}
            Err(error) => log::warn!("Serial read error on {}: {error}", self.port_name),
        }
    }
}

#[cfg(feature = "instrument_serial")]
impl BusTransport for SerialBusTransport {
    fn connect(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|error| {
                VrError::Hardware(format!(
                    "failed to open serial port {}: {error}",
                    self.port_name
                ))
            })?;
        self.port = Some(port);
        Ok(())
    }

    fn send(&mut self, frame: &CommandFrame) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(VrError::SerialPortNotConnected)?;
        let wire = encode(frame);
        std::io::Write::write_all(port, &wire)?;
        Ok(())
    }

    fn try_receive(&mut self) -> Option<ModuleMessage> {
        self.fill_buffer();
        while self.buffer.len() >= FRAME_LEN {
            let type_code = self.buffer[0];
            let event = self.buffer[1];
            let value = i32::from_le_bytes([
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
                self.buffer[5],
            ]);
            self.buffer.advance(FRAME_LEN);
            match ModuleKind::from_type_code(type_code) {
                Some(module) => match decode(module, event, value) {
                    Some(message) => return Some(message),
                    None => {
                        log::warn!("Unknown event code {event} from module {module:?}");
                    }
                },
                None => log::warn!("Frame from unknown module type code {type_code}"),
            }
        }
        None
    }

    fn disconnect(&mut self) -> AppResult<()> {
        self.port = None;
        Ok(())
    }
}
