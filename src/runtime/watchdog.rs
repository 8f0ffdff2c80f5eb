//! Imaging-device heartbeat watchdog.
//!
//! The imaging device emits a frame-acquired pulse at a bounded maximum
//! interval (~10 Hz by default). The watchdog tracks pulse progress against
//! that bound and grants exactly one automatic recovery attempt before
//! escalating to the operator — continuing to collect data with a silent
//! imaging device would misalign everything recorded afterwards.

use std::time::Duration;

/// Watchdog verdict for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Pulses are arriving within the bound.
    Alive,
    /// The bound elapsed without a pulse; one recovery trigger should be
    /// sent now.
    Stalled,
    /// Recovery was attempted and the grace period elapsed without pulses;
    /// escalate to the operator.
    Lost,
}

/// Tracks frame-pulse progress against the heartbeat bound.
#[derive(Debug)]
pub struct HeartbeatWatchdog {
    interval_us: u64,
    grace_us: u64,
    last_frame_count: u64,
    last_progress_us: u64,
    recovery_sent_at_us: Option<u64>,
    armed: bool,
}

impl HeartbeatWatchdog {
    pub fn new(interval: Duration, grace: Duration) -> Self {
        Self {
            interval_us: interval.as_micros() as u64,
            grace_us: grace.as_micros() as u64,
            last_frame_count: 0,
            last_progress_us: 0,
            recovery_sent_at_us: None,
            armed: false,
        }
    }

    /// Starts watching from the given timestamp.
    pub fn arm(&mut self, frame_count: u64, now_us: u64) {
        self.last_frame_count = frame_count;
        self.last_progress_us = now_us;
        self.recovery_sent_at_us = None;
        self.armed = true;
    }

    /// Stops watching (acquisition intentionally stopped).
    pub fn disarm(&mut self) {
        self.armed = false;
        self.recovery_sent_at_us = None;
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    /// Microseconds since the last observed pulse progress.
    pub fn silent_for_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.last_progress_us)
    }

    /// Folds one frame-count observation into the watchdog.
    pub fn observe(&mut self, frame_count: u64, now_us: u64) -> HeartbeatStatus {
        if !self.armed {
            return HeartbeatStatus::Alive;
        }
        if frame_count != self.last_frame_count {
            self.last_frame_count = frame_count;
            self.last_progress_us = now_us;
            self.recovery_sent_at_us = None;
            return HeartbeatStatus::Alive;
        }
        match self.recovery_sent_at_us {
            None => {
                if now_us.saturating_sub(self.last_progress_us) > self.interval_us {
                    self.recovery_sent_at_us = Some(now_us);
                    HeartbeatStatus::Stalled
                } else {
                    HeartbeatStatus::Alive
                }
            }
            Some(recovery_us) => {
                if now_us.saturating_sub(recovery_us) > self.grace_us {
                    HeartbeatStatus::Lost
                } else {
                    HeartbeatStatus::Alive
                }
            }
        }
    }
}
