//! Typed hardware module interfaces.
//!
//! Each interface owns the parameters of one physical module, translates
//! high-level requests into bus commands and folds incoming event messages
//! into the shared trackers. The interfaces never decide *when* the hardware
//! state changes: the runtime state machine is the only writer of the four
//! state aspects (break, encoder, torque, screens), and it drives these
//! interfaces through the bus.

use crate::config::ValveCalibration;
use crate::error::AppResult;
use crate::hardware::bus_types::{
    BusTransport, CommandFrame, ModuleCommand, ModuleEvent, ModuleKind, ModuleMessage,
};
use crate::hardware::trackers::SharedTrackers;
use crate::session::artifacts::HardwareSnapshot;

/// Default buzzer tone length used when simulating a reward.
pub const REWARD_TONE_MS: u32 = 300;

fn send(
    transport: &mut dyn BusTransport,
    module: ModuleKind,
    command: ModuleCommand,
) -> AppResult<()> {
    transport.send(&CommandFrame { module, command })
}

/// Solenoid valve interface.
///
/// Owns the immutable per-session calibration curve and converts requested
/// reward volumes into open durations via interpolation.
#[derive(Debug)]
pub struct ValveInterface {
    calibration: ValveCalibration,
    last_pulse_us: u32,
}

impl ValveInterface {
    pub fn new(calibration: ValveCalibration) -> Self {
        Self {
            calibration,
            last_pulse_us: 0,
        }
    }

    /// The calibration curve active for this session.
    pub fn calibration(&self) -> &ValveCalibration {
        &self.calibration
    }

    /// Opens the valve long enough to dispense `volume_ul` microliters.
    pub fn deliver(
        &mut self,
        transport: &mut dyn BusTransport,
        volume_ul: f64,
    ) -> AppResult<()> {
        let duration_us = self.calibration.duration_for_volume(volume_ul).round() as u32;
        self.last_pulse_us = duration_us;
        send(
            transport,
            ModuleKind::Valve,
            ModuleCommand::SendPulse { duration_us },
        )
    }

    /// Sounds the buzzer without dispensing water.
    pub fn tone(&mut self, transport: &mut dyn BusTransport) -> AppResult<()> {
        send(
            transport,
            ModuleKind::Valve,
            ModuleCommand::Tone {
                duration_ms: REWARD_TONE_MS,
            },
        )
    }

    /// Opens the valve for an explicit duration (calibration/maintenance).
    pub fn pulse(
        &mut self,
        transport: &mut dyn BusTransport,
        duration_us: u32,
    ) -> AppResult<()> {
        self.last_pulse_us = duration_us;
        send(
            transport,
            ModuleKind::Valve,
            ModuleCommand::SendPulse { duration_us },
        )
    }

    /// Holds the valve open or closed (maintenance only; rewards use
    /// calibrated pulses).
    pub fn set_open(&mut self, transport: &mut dyn BusTransport, open: bool) -> AppResult<()> {
        send(transport, ModuleKind::Valve, ModuleCommand::Toggle { on: open })
    }

    /// Volume a pulse of the given duration dispenses, in microliters.
    fn volume_of_pulse(&self, duration_us: u32) -> f64 {
        // Forward-interpolate along the calibration curve.
        let pairs = self.calibration.pairs();
        let duration = duration_us as f64;
        let segment = pairs
            .windows(2)
            .find(|w| duration <= w[1].0)
            .unwrap_or_else(|| &pairs[pairs.len() - 2..]);
        let (d0, v0) = segment[0];
        let (d1, v1) = segment[1];
        v0 + (duration - d0) / (d1 - d0) * (v1 - v0)
    }

    pub fn process_received_data(&mut self, message: &ModuleMessage, trackers: &SharedTrackers) {
        match message.event {
            ModuleEvent::ValveOpened => trackers.record_valve_open(),
            ModuleEvent::ValveClosed => {
                let volume_ul = self.volume_of_pulse(self.last_pulse_us);
                trackers.add_dispensed_ul(volume_ul);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self, snapshot: &mut HardwareSnapshot) {
        snapshot.valve_calibration = Some(self.calibration.clone());
    }
}

/// Lick sensor interface.
#[derive(Debug)]
pub struct LickInterface {
    threshold_adc: u16,
    above_threshold: bool,
}

impl LickInterface {
    pub fn new(threshold_adc: u16) -> Self {
        Self {
            threshold_adc,
            above_threshold: false,
        }
    }

    pub fn enable(&mut self, transport: &mut dyn BusTransport) -> AppResult<()> {
        send(transport, ModuleKind::Lick, ModuleCommand::Enable)
    }

    pub fn disable(&mut self, transport: &mut dyn BusTransport) -> AppResult<()> {
        send(transport, ModuleKind::Lick, ModuleCommand::Disable)
    }

    pub fn process_received_data(&mut self, message: &ModuleMessage, trackers: &SharedTrackers) {
        if let ModuleEvent::LickLevel { adc } = message.event {
            let above = adc >= self.threshold_adc;
            // Count the rising edge only, not every sample above threshold.
            if above && !self.above_threshold {
                trackers.record_lick();
            }
            self.above_threshold = above;
        }
    }

    pub fn snapshot(&self, snapshot: &mut HardwareSnapshot) {
        snapshot.lick_threshold = Some(self.threshold_adc);
    }
}

/// Wheel break interface.
#[derive(Debug)]
pub struct BreakInterface {
    engaged: bool,
}

impl BreakInterface {
    pub fn new() -> Self {
        Self { engaged: true }
    }

    pub fn set_engaged(
        &mut self,
        transport: &mut dyn BusTransport,
        engaged: bool,
    ) -> AppResult<()> {
        self.engaged = engaged;
        send(
            transport,
            ModuleKind::Break,
            ModuleCommand::Toggle { on: engaged },
        )
    }

    pub fn engaged(&self) -> bool {
        self.engaged
    }
}

impl Default for BreakInterface {
    fn default() -> Self {
        Self::new()
    }
}

/// Wheel encoder interface.
#[derive(Debug)]
pub struct EncoderInterface {
    cm_per_pulse: f64,
    enabled: bool,
}

impl EncoderInterface {
    pub fn new(cm_per_pulse: f64) -> Self {
        Self {
            cm_per_pulse,
            enabled: false,
        }
    }

    pub fn cm_per_pulse(&self) -> f64 {
        self.cm_per_pulse
    }

    pub fn set_enabled(
        &mut self,
        transport: &mut dyn BusTransport,
        enabled: bool,
    ) -> AppResult<()> {
        self.enabled = enabled;
        let command = if enabled {
            ModuleCommand::Enable
        } else {
            ModuleCommand::Disable
        };
        send(transport, ModuleKind::Encoder, command)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn process_received_data(&mut self, message: &ModuleMessage, trackers: &SharedTrackers) {
        if let ModuleEvent::EncoderDelta { pulses } = message.event {
            trackers.add_encoder_pulses(pulses as i64);
        }
    }

    pub fn snapshot(&self, snapshot: &mut HardwareSnapshot) {
        snapshot.cm_per_pulse = Some(self.cm_per_pulse);
    }
}

/// Torque sensor interface.
#[derive(Debug)]
pub struct TorqueInterface {
    torque_per_adc_unit: f64,
    enabled: bool,
}

impl TorqueInterface {
    pub fn new(torque_per_adc_unit: f64) -> Self {
        Self {
            torque_per_adc_unit,
            enabled: false,
        }
    }

    pub fn set_enabled(
        &mut self,
        transport: &mut dyn BusTransport,
        enabled: bool,
    ) -> AppResult<()> {
        self.enabled = enabled;
        let command = if enabled {
            ModuleCommand::Enable
        } else {
            ModuleCommand::Disable
        };
        send(transport, ModuleKind::Torque, command)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn process_received_data(&mut self, message: &ModuleMessage, trackers: &SharedTrackers) {
        if let ModuleEvent::TorqueReading { adc } = message.event {
            trackers.set_torque_adc(adc);
        }
    }

    pub fn snapshot(&self, snapshot: &mut HardwareSnapshot) {
        snapshot.torque_per_adc_unit = Some(self.torque_per_adc_unit);
    }
}

/// VR screen power interface.
#[derive(Debug)]
pub struct ScreenInterface {
    on: bool,
    initially_on: bool,
}

impl ScreenInterface {
    pub fn new(initially_on: bool) -> Self {
        Self {
            on: initially_on,
            initially_on,
        }
    }

    pub fn set_on(&mut self, transport: &mut dyn BusTransport, on: bool) -> AppResult<()> {
        self.on = on;
        send(transport, ModuleKind::Screens, ModuleCommand::Toggle { on })
    }

    pub fn on(&self) -> bool {
        self.on
    }

    pub fn snapshot(&self, snapshot: &mut HardwareSnapshot) {
        snapshot.screens_initially_on = Some(self.initially_on);
    }
}

/// Imaging-device TTL interface.
///
/// Two output lines (start/stop acquisition) plus the frame-acquired input
/// pulse that serves as the device heartbeat.
#[derive(Debug, Default)]
pub struct FrameTtlInterface {
    monitored: bool,
}

impl FrameTtlInterface {
    pub fn new() -> Self {
        Self { monitored: false }
    }

    pub fn start_acquisition(&mut self, transport: &mut dyn BusTransport) -> AppResult<()> {
        self.monitored = true;
        send(transport, ModuleKind::FrameTtl, ModuleCommand::StartAcquisition)
    }

    pub fn stop_acquisition(&mut self, transport: &mut dyn BusTransport) -> AppResult<()> {
        send(transport, ModuleKind::FrameTtl, ModuleCommand::StopAcquisition)
    }

    pub fn process_received_data(
        &mut self,
        message: &ModuleMessage,
        trackers: &SharedTrackers,
        elapsed_us: u64,
    ) {
        if let ModuleEvent::FramePulse = message.event {
            trackers.record_frame_pulse(elapsed_us);
        }
    }

    pub fn snapshot(&self, snapshot: &mut HardwareSnapshot) {
        snapshot.frame_ttl_monitored = Some(self.monitored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::bus::MockTransport;

    fn calibration() -> ValveCalibration {
        ValveCalibration::new(vec![(15_000.0, 1.8556), (30_000.0, 3.4844)])
            .expect("valid calibration")
    }

    #[test]
    fn test_valve_delivery_uses_interpolated_duration() {
        let mut transport = MockTransport::new();
        let mut valve = ValveInterface::new(calibration());
        valve.deliver(&mut transport, 2.5).expect("deliver");

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        match sent[0].command {
            ModuleCommand::SendPulse { duration_us } => {
                assert!(duration_us > 15_000 && duration_us < 30_000);
            }
            ref other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_valve_close_event_accumulates_dispensed_volume() {
        let mut transport = MockTransport::new();
        let trackers = SharedTrackers::new();
        let mut valve = ValveInterface::new(calibration());
        valve.deliver(&mut transport, 2.5).expect("deliver");
        valve.process_received_data(
            &ModuleMessage {
                module: ModuleKind::Valve,
                event: ModuleEvent::ValveClosed,
            },
            &trackers,
        );
        let dispensed = trackers.dispensed_ul();
        assert!((dispensed - 2.5).abs() < 0.01, "dispensed {dispensed}");
    }

    #[test]
    fn test_lick_interface_counts_rising_edges_only() {
        let trackers = SharedTrackers::new();
        let mut lick = LickInterface::new(200);
        for adc in [50, 250, 260, 80, 300] {
            lick.process_received_data(
                &ModuleMessage {
                    module: ModuleKind::Lick,
                    event: ModuleEvent::LickLevel { adc },
                },
                &trackers,
            );
        }
        assert_eq!(trackers.lick_count(), 2);
    }

    #[test]
    fn test_encoder_accumulates_signed_deltas() {
        let mut transport = MockTransport::new();
        let trackers = SharedTrackers::new();
        let mut encoder = EncoderInterface::new(0.005);
        encoder.set_enabled(&mut transport, true).expect("enable");
        for pulses in [100, -20, 60] {
            encoder.process_received_data(
                &ModuleMessage {
                    module: ModuleKind::Encoder,
                    event: ModuleEvent::EncoderDelta { pulses },
                },
                &trackers,
            );
        }
        assert_eq!(trackers.encoder_pulses(), 140);
        assert!((trackers.distance_cm(0.005) - 0.7).abs() < 1e-9);
    }
}
