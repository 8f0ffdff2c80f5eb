//! Monotonic microsecond timebase shared by every log source in a process.
//!
//! All runtime log records carry timestamps taken from a single
//! `MonotonicClock` per source process. Cross-process log merging during
//! later processing relies on this shared timebase (the UTC onset anchor
//! written into each log stream), not on record arrival order.

use chrono::Utc;
use std::time::{Duration, Instant};

/// A monotonic, microsecond-precision clock anchored to a UTC onset.
///
/// The clock captures both `Instant::now()` and the wall-clock UTC time at
/// construction. `elapsed_us()` is monotonic and immune to wall-clock
/// adjustments; `onset_us()` lets downstream processing convert elapsed
/// offsets back into absolute UTC microsecond timestamps.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor: Instant,
    onset_us: i64,
}

impl MonotonicClock {
    /// Starts a new clock anchored to the current instant.
    pub fn start() -> Self {
        Self {
            anchor: Instant::now(),
            onset_us: Utc::now().timestamp_micros(),
        }
    }

    /// Microseconds elapsed since the clock was started.
    pub fn elapsed_us(&self) -> u64 {
        self.anchor.elapsed().as_micros() as u64
    }

    /// Elapsed time since the clock was started.
    pub fn elapsed(&self) -> Duration {
        self.anchor.elapsed()
    }

    /// UTC microseconds since the Unix epoch at which this clock started.
    pub fn onset_us(&self) -> i64 {
        self.onset_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_is_monotonic() {
        let clock = MonotonicClock::start();
        let a = clock.elapsed_us();
        let b = clock.elapsed_us();
        assert!(b >= a);
    }

    #[test]
    fn test_onset_is_plausible() {
        let clock = MonotonicClock::start();
        // Any date after 2020-01-01 in microseconds.
        assert!(clock.onset_us() > 1_577_836_800_000_000);
    }
}
