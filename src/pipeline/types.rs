//! Core time types for the playback pipeline

use std::time::Duration;

/// Microseconds in one second (the stream-independent time base).
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Timestamp representation for stream time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Microseconds since the beginning of the stream
    pub micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a new timestamp from microseconds
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since the start of the stream
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Seconds as a float, for display and rate math
    pub fn as_secs_f64(&self) -> f64 {
        self.micros as f64 / MICROS_PER_SECOND as f64
    }

    /// Clamp into `[0, max]`
    pub fn clamp_to(&self, max: Timestamp) -> Self {
        Self {
            micros: self.micros.clamp(0, max.micros.max(0)),
        }
    }

    /// Calculate the absolute difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Rational number of seconds per stream tick.
///
/// Container timestamps (PTS, duration, seek targets) are integer multiples
/// of a per-stream time base such as 1/30000 or 1/90000. Converting between
/// ticks and microseconds goes through 128-bit intermediates so long streams
/// with fine time bases do not overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// A time base is usable when both terms are positive.
    pub const fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Convert a tick count in this time base to microseconds.
    pub fn ticks_to_micros(&self, ticks: i64) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        let scaled = ticks as i128 * self.num as i128 * MICROS_PER_SECOND as i128;
        (scaled / self.den as i128) as i64
    }

    /// Convert microseconds to a tick count in this time base, rounding down.
    pub fn micros_to_ticks(&self, micros: i64) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        let scaled = micros as i128 * self.den as i128;
        let divisor = self.num as i128 * MICROS_PER_SECOND as i128;
        scaled.div_euclid(divisor) as i64
    }

    pub fn ticks_to_timestamp(&self, ticks: i64) -> Timestamp {
        Timestamp::from_micros(self.ticks_to_micros(ticks))
    }

    pub fn timestamp_to_ticks(&self, timestamp: Timestamp) -> i64 {
        self.micros_to_ticks(timestamp.micros)
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
