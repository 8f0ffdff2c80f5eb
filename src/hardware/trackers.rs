//! Lock-free shared trackers fed by the hardware bus.
//!
//! Module I/O runs in its own worker context; the runtime control loop reads
//! these trackers once per cycle. All fields are plain atomics so readers
//! never synchronize with the bus worker. Dispensed volume is stored in
//! nanoliters to keep the counter integral.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared hardware counters readable from any thread without locking.
#[derive(Debug, Default)]
pub struct SharedTrackers {
    encoder_pulses: AtomicI64,
    lick_count: AtomicU64,
    valve_open_count: AtomicU64,
    dispensed_nl: AtomicU64,
    frame_count: AtomicU64,
    last_frame_us: AtomicU64,
    torque_adc: AtomicI64,
}

impl SharedTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_encoder_pulses(&self, delta: i64) {
        self.encoder_pulses.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn encoder_pulses(&self) -> i64 {
        self.encoder_pulses.load(Ordering::Relaxed)
    }

    /// Cumulative distance in centimeters for the given encoder resolution.
    pub fn distance_cm(&self, cm_per_pulse: f64) -> f64 {
        self.encoder_pulses() as f64 * cm_per_pulse
    }

    pub fn record_lick(&self) {
        self.lick_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lick_count(&self) -> u64 {
        self.lick_count.load(Ordering::Relaxed)
    }

    pub fn record_valve_open(&self) {
        self.valve_open_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn valve_open_count(&self) -> u64 {
        self.valve_open_count.load(Ordering::Relaxed)
    }

    pub fn add_dispensed_ul(&self, volume_ul: f64) {
        let nanoliters = (volume_ul * 1_000.0).round() as u64;
        self.dispensed_nl.fetch_add(nanoliters, Ordering::Relaxed);
    }

    pub fn dispensed_ul(&self) -> f64 {
        self.dispensed_nl.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    /// Overwrites the dispensed-volume counter. Used when resuming from a
    /// pause to discard water dispensed while the runtime was suspended.
    pub fn set_dispensed_ul(&self, volume_ul: f64) {
        let nanoliters = (volume_ul * 1_000.0).round() as u64;
        self.dispensed_nl.store(nanoliters, Ordering::Relaxed);
    }

    pub fn record_frame_pulse(&self, elapsed_us: u64) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        self.last_frame_us.store(elapsed_us, Ordering::Relaxed);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn reset_frame_count(&self) {
        self.frame_count.store(0, Ordering::Relaxed);
    }

    /// Elapsed-microsecond timestamp of the latest frame pulse (0 if none).
    pub fn last_frame_us(&self) -> u64 {
        self.last_frame_us.load(Ordering::Relaxed)
    }

    pub fn set_torque_adc(&self, adc: i16) {
        self.torque_adc.store(adc as i64, Ordering::Relaxed);
    }

    pub fn torque_adc(&self) -> i16 {
        self.torque_adc.load(Ordering::Relaxed) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispensed_volume_round_trips_through_nanoliters() {
        let trackers = SharedTrackers::new();
        trackers.add_dispensed_ul(2.5);
        trackers.add_dispensed_ul(1.8556);
        assert!((trackers.dispensed_ul() - 4.3556).abs() < 0.001);
        trackers.set_dispensed_ul(2.5);
        assert!((trackers.dispensed_ul() - 2.5).abs() < 0.001);
    }

    #[test]
    fn test_frame_pulse_updates_count_and_timestamp() {
        let trackers = SharedTrackers::new();
        trackers.record_frame_pulse(1_000);
        trackers.record_frame_pulse(101_000);
        assert_eq!(trackers.frame_count(), 2);
        assert_eq!(trackers.last_frame_us(), 101_000);
        trackers.reset_frame_count();
        assert_eq!(trackers.frame_count(), 0);
    }
}
