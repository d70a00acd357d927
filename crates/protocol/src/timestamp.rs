//! Frame transmit timestamps (TIST)
//!
//! A [`FrameTimestamp`] is the in-band transmit time of one ensemble frame:
//! whole seconds since the EDI epoch (2000-01-01T00:00:00Z) plus the TSTA
//! word whose lower 14 bits count 1/16384-second units. The upper TSTA bits
//! carry validity and sub-sample flags and only participate in ordering.
//!
//! Timestamps are small plain values; they are copied, never aliased.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the UNIX epoch and 2000-01-01T00:00:00Z.
const EDI_EPOCH_UNIX: u64 = 946_684_800;

/// Units per second in the lower 14 bits of TSTA.
const TSTA_UNITS_PER_SECOND: u32 = 16_384;

const TSTA_FRACTION_MASK: u32 = TSTA_UNITS_PER_SECOND - 1;

/// Transmit timestamp of one ensemble frame.
///
/// Total ordering is lexicographic on `(seconds, tsta)`, which the derived
/// `Ord` provides thanks to field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameTimestamp {
    /// UTC seconds since 2000-01-01.
    pub seconds: u32,
    /// Fractional part in 1/16384 s units (lower 14 bits) plus flags.
    pub tsta: u32,
}

impl FrameTimestamp {
    pub fn new(seconds: u32, tsta: u32) -> Self {
        Self { seconds, tsta }
    }

    /// A timestamp is valid when its seconds field is non-zero.
    pub fn valid(&self) -> bool {
        self.seconds != 0
    }

    /// Fractional part of the second, in milliseconds.
    pub fn fraction_ms(&self) -> u32 {
        (self.tsta & TSTA_FRACTION_MASK) * 1000 / TSTA_UNITS_PER_SECOND
    }

    /// Convert to wall-clock time: EDI epoch + seconds + tsta/16384 s.
    pub fn to_system_time(&self) -> SystemTime {
        let fraction = self.tsta & TSTA_FRACTION_MASK;
        let nanos = u64::from(fraction) * 1_000_000_000 / u64::from(TSTA_UNITS_PER_SECOND);
        UNIX_EPOCH
            + Duration::from_secs(EDI_EPOCH_UNIX + u64::from(self.seconds))
            + Duration::from_nanos(nanos)
    }

    /// Signed distance from `now` to this timestamp, in milliseconds.
    /// Positive means the frame's transmit time is still in the future.
    pub fn margin_ms(&self, now: SystemTime) -> i64 {
        let ts = self.to_system_time();
        match ts.duration_since(now) {
            Ok(ahead) => ahead.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }
}

#[cfg(test)]
#[path = "timestamp_test.rs"]
mod tests;
