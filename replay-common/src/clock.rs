use std::time::{Duration, Instant};

use crate::duration_nanos;

/// A clock that follows capture time.
///
/// Packets carry the timestamp at which they were captured, which for a capture file can be
/// far in the past. Idle detection has to be expressed in that timeline, but must also keep
/// advancing when no packets arrive (a live capture going quiet). The clock therefore reports
/// the latest observed capture timestamp plus the wall time elapsed since it was observed.
#[derive(Debug, Clone, Copy)]
pub struct CaptureClock {
    /// Latest capture timestamp, in UNIX nanoseconds.
    latest: u64,
    /// When `latest` was observed.
    observed_at: Instant,
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self { latest: 0, observed_at: Instant::now() }
    }
}

impl CaptureClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a capture timestamp. Timestamps older than the latest one are ignored.
    pub fn observe(&mut self, timestamp_nanos: u64) {
        if timestamp_nanos >= self.now() {
            self.latest = timestamp_nanos;
            self.observed_at = Instant::now();
        }
    }

    /// Returns the current capture time in UNIX nanoseconds.
    pub fn now(&self) -> u64 {
        self.latest.saturating_add(duration_nanos(self.observed_at.elapsed()))
    }

    /// Returns the capture time `window` ago, saturating at 0.
    pub fn cutoff(&self, window: Duration) -> u64 {
        self.now().saturating_sub(duration_nanos(window))
    }
}
