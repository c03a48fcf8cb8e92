//! Playback clock mapping wall-clock time to stream time

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::Timestamp;

/// Source of monotonic wall-clock time in microseconds.
pub trait WallClock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Wall clock backed by `Instant`, counting from its creation.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    base: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl WallClock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        self.base.elapsed().as_micros() as i64
    }
}

/// Audio output that can act as the master clock.
///
/// Implemented by the audio engine; its consumed-sample counter is written
/// by the audio callback thread, so implementors lock internally.
pub trait AudioSync: Send + Sync {
    /// Current playback position, or `None` while audio is not a reliable
    /// clock (not started, finished, or disabled).
    fn position(&self) -> Option<Timestamp>;

    /// Move the playback position.
    fn seek(&self, target: Timestamp);

    /// Pause or resume sample consumption.
    fn set_paused(&self, paused: bool);
}

/// Result of advancing the clock by one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    /// Normal progress
    Advanced(Timestamp),
    /// Clock is frozen
    Paused(Timestamp),
    /// Time jumped backward by more than the resync threshold; the caller
    /// must issue a corrective seek to `to`.
    Drifted { from: Timestamp, to: Timestamp },
}

/// Playback clock
///
/// Keeps the pair `(start, now)` such that, while playing from the wall
/// clock, `now == wall_clock() - start`. Every operation that moves `now`
/// moves `start` with it so the relation keeps holding afterwards.
///
/// The clock is owned by the presentation loop and mutated only from that
/// thread; the only shared piece is the optional audio master clock.
pub struct PlaybackClock {
    wall: Arc<dyn WallClock>,

    /// Wall-clock microseconds at which stream time 0 would have played
    start: i64,

    /// Elapsed stream time
    now: Timestamp,

    /// Stream duration, `Timestamp::ZERO` when unknown
    duration: Timestamp,

    paused: bool,

    /// Raised by `seek`, consumed by the presentation loop
    seek_pending: bool,

    /// Backward jumps larger than this trigger a corrective seek
    resync_threshold: Duration,

    audio: Option<Arc<dyn AudioSync>>,
}

impl PlaybackClock {
    pub fn new(wall: Arc<dyn WallClock>, resync_threshold: Duration) -> Self {
        let start = wall.now_micros();
        Self {
            wall,
            start,
            now: Timestamp::ZERO,
            duration: Timestamp::ZERO,
            paused: false,
            seek_pending: false,
            resync_threshold,
            audio: None,
        }
    }

    pub fn set_duration(&mut self, duration: Timestamp) {
        self.duration = duration;
    }

    pub fn duration(&self) -> Timestamp {
        self.duration
    }

    /// Use the given audio output as the master clock when it reports a position.
    pub fn attach_audio(&mut self, audio: Arc<dyn AudioSync>) {
        audio.set_paused(self.paused);
        self.audio = Some(audio);
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True while the audio output drives `now`.
    pub fn follows_audio(&self) -> bool {
        self.audio
            .as_ref()
            .is_some_and(|audio| audio.position().is_some())
    }

    pub fn seek_pending(&self) -> bool {
        self.seek_pending
    }

    /// Clear and return the seek-pending flag.
    pub fn take_seek_pending(&mut self) -> bool {
        std::mem::take(&mut self.seek_pending)
    }

    /// Clamp `target` to the stream, jump there and raise the seek-pending flag.
    ///
    /// Returns the clamped target, which is what the decoder and any
    /// subscribers must be told.
    pub fn seek(&mut self, target: Timestamp) -> Timestamp {
        let target = self.clamp(target);
        self.set_position(target);
        self.seek_pending = true;

        if let Some(audio) = &self.audio {
            audio.seek(target);
        }
        target
    }

    /// Move to `position` without a decoder seek.
    ///
    /// Used for periodic time-sync corrections from the authority and to
    /// realign on the actual landing point of a seek.
    pub fn resync(&mut self, position: Timestamp) {
        self.set_position(position);
    }

    /// Move to the frame a seek actually landed on, dragging audio along.
    pub fn realign(&mut self, position: Timestamp) {
        self.set_position(position);
        if let Some(audio) = &self.audio {
            audio.seek(position);
        }
    }

    fn set_position(&mut self, position: Timestamp) {
        self.start = self.wall.now_micros() - position.micros;
        self.now = position;
    }

    fn clamp(&self, target: Timestamp) -> Timestamp {
        if self.duration > Timestamp::ZERO {
            target.clamp_to(self.duration)
        } else {
            Timestamp::from_micros(target.micros.max(0))
        }
    }

    /// Freeze or unfreeze `now`.
    ///
    /// Resuming recomputes `start` from the frozen `now`, so time spent
    /// paused is not added to the stream position.
    pub fn set_paused(&mut self, paused: bool) {
        if paused == self.paused {
            return;
        }
        if !paused {
            self.start = self.wall.now_micros() - self.now.micros;
        }
        self.paused = paused;

        if let Some(audio) = &self.audio {
            audio.set_paused(paused);
        }
    }

    /// Flip the pause state, returning the new state.
    pub fn toggle_pause(&mut self) -> bool {
        self.set_paused(!self.paused);
        self.paused
    }

    /// Advance `now` from the audio master clock or the wall clock.
    pub fn tick(&mut self) -> ClockTick {
        if self.paused {
            return ClockTick::Paused(self.now);
        }

        let wall_now = self.wall.now_micros();
        let next = match self.audio.as_ref().and_then(|audio| audio.position()) {
            Some(audio_now) => {
                // keep start consistent so falling back to the wall clock is seamless
                self.start = wall_now - audio_now.micros;
                audio_now
            }
            None => Timestamp::from_micros(wall_now - self.start),
        };

        let previous = self.now;
        self.now = next;

        let threshold = self.resync_threshold.as_micros() as i64;
        if previous.micros - next.micros > threshold {
            ClockTick::Drifted {
                from: previous,
                to: next,
            }
        } else {
            ClockTick::Advanced(next)
        }
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("start", &self.start)
            .field("now", &self.now)
            .field("duration", &self.duration)
            .field("paused", &self.paused)
            .field("seek_pending", &self.seek_pending)
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

/// Manually driven wall clock for deterministic tests
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<std::sync::atomic::AtomicI64>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(micros: i64) -> Self {
        Self {
            micros: Arc::new(std::sync::atomic::AtomicI64::new(micros)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(
            by.as_micros() as i64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    /// Step the wall clock backward, as a suspended host or a clock change would.
    pub fn rewind(&self, by: Duration) {
        self.micros.fetch_sub(
            by.as_micros() as i64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
impl WallClock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.micros.load(std::sync::atomic::Ordering::SeqCst)
    }
}
