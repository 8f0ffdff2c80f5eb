//! The acquisition microcontroller bus.
//!
//! `MicrocontrollerBus` owns every module interface plus the transport that
//! carries their frames, and is itself owned by the runtime state machine —
//! the single component allowed to mutate hardware state. All other
//! components only ever see the read-only [`SharedTrackers`] snapshot.

use crate::clock::MonotonicClock;
use crate::config::ValveCalibration;
use crate::error::{AppResult, VrError};
use crate::hardware::bus_types::{BusTransport, CommandFrame, ModuleKind, ModuleMessage};
use crate::hardware::modules::{
    BreakInterface, EncoderInterface, FrameTtlInterface, LickInterface, ScreenInterface,
    TorqueInterface, ValveInterface,
};
use crate::hardware::trackers::SharedTrackers;
use crate::session::artifacts::HardwareSnapshot;
use std::collections::VecDeque;
use std::sync::Arc;

/// Upper bound on messages drained per control-loop cycle, keeping the
/// per-cycle cost bounded and predictable.
const MAX_MESSAGES_PER_CYCLE: usize = 64;

// Hardware parameter defaults.
const DEFAULT_LICK_THRESHOLD_ADC: u16 = 200;
const DEFAULT_CM_PER_PULSE: f64 = 0.005;
const DEFAULT_TORQUE_PER_ADC_UNIT: f64 = 0.012;

/// Static parameters of the attached hardware modules.
#[derive(Debug, Clone)]
pub struct HardwareParameters {
    pub valve_calibration: ValveCalibration,
    pub lick_threshold_adc: u16,
    pub cm_per_pulse: f64,
    pub torque_per_adc_unit: f64,
    pub screens_initially_on: bool,
}

impl HardwareParameters {
    /// Parameters with default thresholds around an explicit calibration
    /// curve (the curve itself has no meaningful default).
    pub fn with_calibration(valve_calibration: ValveCalibration) -> Self {
        Self {
            valve_calibration,
            lick_threshold_adc: DEFAULT_LICK_THRESHOLD_ADC,
            cm_per_pulse: DEFAULT_CM_PER_PULSE,
            torque_per_adc_unit: DEFAULT_TORQUE_PER_ADC_UNIT,
            screens_initially_on: false,
        }
    }
}

/// Owns the module interfaces and the bus transport.
pub struct MicrocontrollerBus {
    transport: Box<dyn BusTransport>,
    valve: ValveInterface,
    lick: LickInterface,
    brake: BreakInterface,
    encoder: EncoderInterface,
    torque: TorqueInterface,
    screens: ScreenInterface,
    frame_ttl: FrameTtlInterface,
    trackers: Arc<SharedTrackers>,
    clock: MonotonicClock,
    connected: bool,
}

impl MicrocontrollerBus {
    pub fn new(
        transport: Box<dyn BusTransport>,
        parameters: HardwareParameters,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            transport,
            valve: ValveInterface::new(parameters.valve_calibration),
            lick: LickInterface::new(parameters.lick_threshold_adc),
            brake: BreakInterface::new(),
            encoder: EncoderInterface::new(parameters.cm_per_pulse),
            torque: TorqueInterface::new(parameters.torque_per_adc_unit),
            screens: ScreenInterface::new(parameters.screens_initially_on),
            frame_ttl: FrameTtlInterface::new(),
            trackers: Arc::new(SharedTrackers::new()),
            clock,
            connected: false,
        }
    }

    /// Establishes the hardware connection. Communication failures here are
    /// fatal for the session: no data-generating state is entered.
    pub fn connect(&mut self) -> AppResult<()> {
        self.transport.connect()?;
        self.connected = true;
        log::info!("Microcontroller bus connected");
        Ok(())
    }

    /// Releases the hardware connection. Safe to call repeatedly.
    pub fn disconnect(&mut self) -> AppResult<()> {
        if self.connected {
            self.transport.disconnect()?;
            self.connected = false;
            log::info!("Microcontroller bus disconnected");
        }
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Drains pending module messages into the shared trackers.
    ///
    /// Never blocks; processes at most [`MAX_MESSAGES_PER_CYCLE`] messages.
    /// Returns the number of messages handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while handled < MAX_MESSAGES_PER_CYCLE {
            let Some(message) = self.transport.try_receive() else {
                break;
            };
            self.dispatch(&message);
            handled += 1;
        }
        handled
    }

    fn dispatch(&mut self, message: &ModuleMessage) {
        match message.module {
            ModuleKind::Valve => self.valve.process_received_data(message, &self.trackers),
            ModuleKind::Lick => self.lick.process_received_data(message, &self.trackers),
            ModuleKind::Encoder => self.encoder.process_received_data(message, &self.trackers),
            ModuleKind::Torque => self.torque.process_received_data(message, &self.trackers),
            ModuleKind::FrameTtl => self.frame_ttl.process_received_data(
                message,
                &self.trackers,
                self.clock.elapsed_us(),
            ),
            ModuleKind::Break | ModuleKind::Screens => {}
        }
    }

    /// Read-only hardware counters, safe to share with any worker.
    pub fn trackers(&self) -> Arc<SharedTrackers> {
        Arc::clone(&self.trackers)
    }

    pub fn cm_per_pulse(&self) -> f64 {
        self.encoder.cm_per_pulse()
    }

    // --- Reward path -------------------------------------------------------

    pub fn deliver_reward(&mut self, volume_ul: f64) -> AppResult<()> {
        self.ensure_connected()?;
        self.valve.deliver(self.transport.as_mut(), volume_ul)
    }

    pub fn simulate_reward(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.valve.tone(self.transport.as_mut())
    }

    pub fn pulse_valve(&mut self, duration_us: u32) -> AppResult<()> {
        self.ensure_connected()?;
        self.valve.pulse(self.transport.as_mut(), duration_us)
    }

    /// Holds the valve open or closed (maintenance only).
    pub fn set_valve_open(&mut self, open: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.valve.set_open(self.transport.as_mut(), open)
    }

    // --- State aspects (driven only by the runtime state machine) ----------

    pub fn set_break(&mut self, engaged: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.brake.set_engaged(self.transport.as_mut(), engaged)
    }

    pub fn set_encoder(&mut self, enabled: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.encoder.set_enabled(self.transport.as_mut(), enabled)
    }

    pub fn set_torque(&mut self, enabled: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.torque.set_enabled(self.transport.as_mut(), enabled)
    }

    pub fn set_screens(&mut self, on: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.screens.set_on(self.transport.as_mut(), on)
    }

    pub fn set_lick_monitoring(&mut self, enabled: bool) -> AppResult<()> {
        self.ensure_connected()?;
        if enabled {
            self.lick.enable(self.transport.as_mut())
        } else {
            self.lick.disable(self.transport.as_mut())
        }
    }

    // --- Imaging trigger protocol ------------------------------------------

    pub fn start_imaging(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.frame_ttl.start_acquisition(self.transport.as_mut())
    }

    pub fn stop_imaging(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.frame_ttl.stop_acquisition(self.transport.as_mut())
    }

    pub fn reset_frame_count(&self) {
        self.trackers.reset_frame_count();
    }

    // -----------------------------------------------------------------------

    /// Captures the parameters downstream log parsing needs. A module whose
    /// field stays `None` did not participate in this session.
    pub fn write_snapshot(&self, snapshot: &mut HardwareSnapshot) {
        self.valve.snapshot(snapshot);
        self.lick.snapshot(snapshot);
        self.encoder.snapshot(snapshot);
        self.torque.snapshot(snapshot);
        self.screens.snapshot(snapshot);
        self.frame_ttl.snapshot(snapshot);
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(VrError::Hardware(
                "microcontroller bus is not connected".into(),
            ))
        }
    }
}

/// In-memory transport used in tests and hardware-free dry runs.
///
/// Records every sent frame and replays queued inbound messages. Valve
/// pulses automatically echo open/close events, matching real module
/// behavior closely enough for runtime logic tests. Clones share state, so
/// a test can keep a handle after the bus takes ownership of its clone.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: std::sync::Arc<std::sync::Mutex<MockTransportState>>,
}

#[derive(Debug, Default)]
struct MockTransportState {
    sent: Vec<CommandFrame>,
    inbound: VecDeque<ModuleMessage>,
    fail_connect: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockTransportState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `connect` call fail.
    pub fn refuse_connection(&self) {
        self.state().fail_connect = true;
    }

    /// Queues a message the bus will receive on a later `poll`.
    pub fn push_inbound(&self, message: ModuleMessage) {
        self.state().inbound.push_back(message);
    }

    /// All frames sent so far, oldest first.
    pub fn sent_frames(&self) -> Vec<CommandFrame> {
        self.state().sent.clone()
    }
}

impl BusTransport for MockTransport {
    fn connect(&mut self) -> AppResult<()> {
        if self.state().fail_connect {
            return Err(VrError::Hardware("mock transport refused connection".into()));
        }
        Ok(())
    }

    fn send(&mut self, frame: &CommandFrame) -> AppResult<()> {
        use crate::hardware::bus_types::{ModuleCommand, ModuleEvent};
        let mut state = self.state();
        if frame.module == ModuleKind::Valve {
            if let ModuleCommand::SendPulse { .. } = frame.command {
                state.inbound.push_back(ModuleMessage {
                    module: ModuleKind::Valve,
                    event: ModuleEvent::ValveOpened,
                });
                state.inbound.push_back(ModuleMessage {
                    module: ModuleKind::Valve,
                    event: ModuleEvent::ValveClosed,
                });
            }
        }
        state.sent.push(frame.clone());
        Ok(())
    }

    fn try_receive(&mut self) -> Option<ModuleMessage> {
        self.state().inbound.pop_front()
    }

    fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::bus_types::ModuleEvent;

    fn test_bus() -> MicrocontrollerBus {
        let calibration = ValveCalibration::new(vec![(15_000.0, 1.8556), (30_000.0, 3.4844)])
            .expect("valid calibration");
        let mut bus = MicrocontrollerBus::new(
            Box::new(MockTransport::new()),
            HardwareParameters::with_calibration(calibration),
            MonotonicClock::start(),
        );
        bus.connect().expect("connect");
        bus
    }

    #[test]
    fn test_commands_require_connection() {
        let calibration = ValveCalibration::new(vec![(15_000.0, 1.8556), (30_000.0, 3.4844)])
            .expect("valid calibration");
        let mut bus = MicrocontrollerBus::new(
            Box::new(MockTransport::new()),
            HardwareParameters::with_calibration(calibration),
            MonotonicClock::start(),
        );
        assert!(bus.set_break(true).is_err());
    }

    #[test]
    fn test_reward_delivery_echoes_through_trackers() {
        let mut bus = test_bus();
        bus.deliver_reward(2.5).expect("deliver");
        bus.poll();
        let trackers = bus.trackers();
        assert_eq!(trackers.valve_open_count(), 1);
        assert!((trackers.dispensed_ul() - 2.5).abs() < 0.01);
    }

    #[test]
    fn test_poll_is_bounded_per_cycle() {
        let mut transport = MockTransport::new();
        for _ in 0..200 {
            transport.push_inbound(ModuleMessage {
                module: ModuleKind::FrameTtl,
                event: ModuleEvent::FramePulse,
            });
        }
        let calibration = ValveCalibration::new(vec![(15_000.0, 1.8556), (30_000.0, 3.4844)])
            .expect("valid calibration");
        let mut bus = MicrocontrollerBus::new(
            Box::new(transport),
            HardwareParameters::with_calibration(calibration),
            MonotonicClock::start(),
        );
        bus.connect().expect("connect");
        assert_eq!(bus.poll(), MAX_MESSAGES_PER_CYCLE);
        assert_eq!(bus.trackers().frame_count(), MAX_MESSAGES_PER_CYCLE as u64);
    }

    #[test]
    fn test_simulate_reward_sends_tone_not_pulse() {
        let mut bus = test_bus();
        bus.simulate_reward().expect("simulate");
        bus.poll();
        // A tone must not open the valve or count as dispensed water.
        assert_eq!(bus.trackers().valve_open_count(), 0);
        assert_eq!(bus.trackers().dispensed_ul(), 0.0);
    }

    #[test]
    fn test_snapshot_covers_active_modules() {
        let bus = test_bus();
        let mut snapshot = HardwareSnapshot::default();
        bus.write_snapshot(&mut snapshot);
        assert!(snapshot.valve_calibration.is_some());
        assert!(snapshot.cm_per_pulse.is_some());
        assert!(snapshot.lick_threshold.is_some());
    }
}
