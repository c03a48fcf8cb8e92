//! Health counters for the playback pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for decoding, presentation and synchronization
///
/// Written from the decode thread, the presentation loop and the network
/// tasks. All fields use relaxed atomics; they are observational only.
#[derive(Debug, Default)]
pub struct PlaybackHealth {
    /// Frames produced by the decode thread
    pub frames_decoded: AtomicU64,

    /// Frames handed to the renderer
    pub frames_presented: AtomicU64,

    /// Frames popped but superseded before being presented (catching up)
    pub frames_skipped: AtomicU64,

    /// Showable frames discarded by a seek
    pub frames_discarded: AtomicU64,

    /// Failed packet or frame decodes
    pub decode_failures: AtomicU64,

    /// Ticks where the clock was ahead of the decoder ("playing faster than decode")
    pub underruns: AtomicU64,

    /// Corrective seeks triggered by clock drift
    pub resyncs: AtomicU64,

    /// Network messages that failed to parse
    pub malformed_messages: AtomicU64,
}

impl PlaybackHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: usize) {
        self.frames_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Percentage of popped frames that were never presented
    pub fn skip_rate(&self) -> f64 {
        let skipped = self.frames_skipped.load(Ordering::Relaxed);
        let presented = self.frames_presented.load(Ordering::Relaxed);
        let total = skipped + presented;
        if total == 0 {
            return 0.0;
        }
        (skipped as f64 / total as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            skip_rate: self.skip_rate(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub frames_decoded: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub frames_discarded: u64,
    pub decode_failures: u64,
    pub underruns: u64,
    pub resyncs: u64,
    pub malformed_messages: u64,
    pub skip_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} decoded, {} presented ({} skipped, {:.2}%), {} discarded by seeks, {} decode failures, {} underruns, {} resyncs, {} malformed messages",
            self.frames_decoded,
            self.frames_presented,
            self.frames_skipped,
            self.skip_rate,
            self.frames_discarded,
            self.decode_failures,
            self.underruns,
            self.resyncs,
            self.malformed_messages
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PlaybackHealth::new();

        health.record_decoded();
        health.record_decoded();
        health.record_presented();
        health.record_skipped();
        health.record_discarded(4);
        health.record_underrun();

        let summary = health.summary();
        assert_eq!(summary.frames_decoded, 2);
        assert_eq!(summary.frames_presented, 1);
        assert_eq!(summary.frames_discarded, 4);
        assert_eq!(summary.underruns, 1);
        assert!((summary.skip_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_skip_rate_without_frames() {
        let health = PlaybackHealth::new();
        assert_eq!(health.skip_rate(), 0.0);
        assert!(health.summary().to_string().starts_with("Health: 0 decoded"));
    }
}
