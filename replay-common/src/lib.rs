use std::time::{Duration, SystemTime};

mod clock;
pub use clock::CaptureClock;

/// Returns the current UNIX timestamp in nanoseconds.
#[inline]
pub fn unix_nanos() -> u64 {
    to_unix_nanos(SystemTime::now())
}

/// Converts a [`SystemTime`] to nanoseconds since the UNIX epoch. Times before the epoch
/// saturate to 0.
#[inline]
pub fn to_unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH).map_or(0, |d| d.as_nanos() as u64)
}

/// Converts a [`Duration`] to whole nanoseconds, saturating at `u64::MAX`.
#[inline]
pub fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
    pub const GiB: u32 = 1024 * MiB;

    /// Capacity of every adapter intake queue, in messages.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
}
