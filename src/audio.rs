//! Audio playback of a fully pre-decoded track
//!
//! The whole track lives in memory as interleaved f32 samples. The cpal
//! callback copies (or, for quad-binaural tracks, mixes) the samples at the
//! current position and advances the consumed-frame counter, which the
//! playback clock reads as its master clock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::f32::consts::TAU;

use anyhow::anyhow;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::pipeline::clock::AudioSync;
use crate::pipeline::types::{MICROS_PER_SECOND, Timestamp};

/// Channel arrangement of a decoded track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioLayout {
    /// Interleaved left/right
    Stereo,
    /// Four stereo recordings facing front, left, back and right, laid out
    /// per frame as the four left channels followed by the four right ones
    QuadBinaural,
}

impl AudioLayout {
    pub fn channels(&self) -> usize {
        match self {
            AudioLayout::Stereo => 2,
            AudioLayout::QuadBinaural => 8,
        }
    }
}

/// Interpolation between the two recordings nearest to a view direction.
///
/// Direction is in radians, 0 facing front and growing counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadBinaural {
    pub fraction_a: f32,
    pub fraction_b: f32,
    pub a: usize,
    pub b: usize,
}

impl QuadBinaural {
    pub fn from_direction(direction: f32) -> Self {
        let quarter = TAU / 4.0;
        let dir = direction.rem_euclid(TAU);
        let theta = dir % quarter;

        let fraction_b = 1.0 - theta / quarter;
        let b = (dir / quarter).floor() as usize % 4;

        Self {
            fraction_a: 1.0 - fraction_b,
            fraction_b,
            a: (b + 1) % 4,
            b,
        }
    }
}

#[derive(Debug)]
struct TrackState {
    /// Next frame to play
    position: usize,
    paused: bool,
    /// Output stream is running
    started: bool,
    direction: f32,
}

/// A pre-decoded audio track plus its playback position.
pub struct AudioTrack {
    samples: Vec<f32>,
    layout: AudioLayout,
    sample_rate: u32,
    state: Mutex<TrackState>,
}

impl AudioTrack {
    pub fn new(samples: Vec<f32>, layout: AudioLayout, sample_rate: u32) -> Self {
        Self {
            samples,
            layout,
            sample_rate,
            state: Mutex::new(TrackState {
                position: 0,
                paused: false,
                started: false,
                direction: 0.0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn layout(&self) -> AudioLayout {
        self.layout
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.layout.channels()
    }

    pub fn duration(&self) -> Timestamp {
        self.frames_to_timestamp(self.frames())
    }

    /// Byte size of the in-memory samples
    pub fn memory_size(&self) -> usize {
        std::mem::size_of_val(self.samples.as_slice())
    }

    /// View yaw used to mix quad-binaural tracks
    pub fn set_direction(&self, direction: f32) {
        self.state().direction = direction;
    }

    pub fn set_started(&self, started: bool) {
        self.state().started = started;
    }

    fn frames_to_timestamp(&self, frames: usize) -> Timestamp {
        if self.sample_rate == 0 {
            return Timestamp::ZERO;
        }
        Timestamp::from_micros(
            (frames as i128 * MICROS_PER_SECOND as i128 / self.sample_rate as i128) as i64,
        )
    }

    fn timestamp_to_frames(&self, timestamp: Timestamp) -> usize {
        let micros = timestamp.micros.max(0) as i128;
        (micros * self.sample_rate as i128 / MICROS_PER_SECOND as i128) as usize
    }

    /// Fill an interleaved stereo output buffer and advance the position.
    ///
    /// Paused tracks output silence without moving; past the end, silence.
    pub fn fill(&self, out: &mut [f32]) {
        let mut state = self.state();
        if state.paused {
            out.fill(0.0);
            return;
        }

        let quad = QuadBinaural::from_direction(state.direction);
        let channels = self.layout.channels();
        let mut position = state.position;

        for pair in out.chunks_mut(2) {
            let start = position * channels;
            let (left, right) = match self.samples.get(start..start + channels) {
                Some(frame) => match self.layout {
                    AudioLayout::Stereo => (frame[0], frame[1]),
                    AudioLayout::QuadBinaural => (
                        quad.fraction_a * frame[quad.a] + quad.fraction_b * frame[quad.b],
                        quad.fraction_a * frame[4 + quad.a] + quad.fraction_b * frame[4 + quad.b],
                    ),
                },
                None => (0.0, 0.0),
            };

            pair[0] = left;
            if let Some(sample) = pair.get_mut(1) {
                *sample = right;
            }
            position += 1;
        }

        state.position = position;
    }
}

impl AudioSync for AudioTrack {
    fn position(&self) -> Option<Timestamp> {
        let state = self.state();
        if state.started && state.position < self.frames() {
            Some(self.frames_to_timestamp(state.position))
        } else {
            None
        }
    }

    fn seek(&self, target: Timestamp) {
        let frames = self.timestamp_to_frames(target);
        self.state().position = frames;
    }

    fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack")
            .field("layout", &self.layout)
            .field("sample_rate", &self.sample_rate)
            .field("frames", &self.frames())
            .field("state", &*self.state())
            .finish()
    }
}

/// Stereo output stream on the default device playing one track.
pub struct AudioPlayer {
    track: Arc<AudioTrack>,
    _stream: cpal::Stream, // kept alive
}

impl AudioPlayer {
    pub fn start(track: Arc<AudioTrack>) -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output audio device"))?;
        let config = cpal::StreamConfig {
            channels: 2,
            sample_rate: track.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let callback_track = Arc::clone(&track);
        let stream = device.build_output_stream(
            &config,
            move |output: &mut [f32], _| callback_track.fill(output),
            |err| log::error!("Audio: output error: {}", err),
            None,
        )?;
        stream.play()?;
        track.set_started(true);

        log::info!(
            "Audio: playing {:.1}s at {} Hz ({:?}, {} bytes)",
            track.duration().as_secs_f64(),
            track.sample_rate(),
            track.layout(),
            track.memory_size()
        );

        Ok(Self {
            track,
            _stream: stream,
        })
    }

    pub fn track(&self) -> &Arc<AudioTrack> {
        &self.track
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.track.set_started(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn stereo_track(frames: usize) -> AudioTrack {
        let samples = (0..frames * 2).map(|i| i as f32).collect();
        AudioTrack::new(samples, AudioLayout::Stereo, 1000)
    }

    #[test]
    fn test_quad_binaural_weights() {
        let front = QuadBinaural::from_direction(0.0);
        assert_eq!((front.b, front.a), (0, 1));
        assert!((front.fraction_b - 1.0).abs() < 1e-6);

        let between = QuadBinaural::from_direction(FRAC_PI_2 / 2.0);
        assert_eq!((between.b, between.a), (0, 1));
        assert!((between.fraction_a - 0.5).abs() < 1e-6);

        let behind_right = QuadBinaural::from_direction(-FRAC_PI_2 / 2.0);
        assert_eq!((behind_right.b, behind_right.a), (3, 0));
    }

    #[test]
    fn test_fill_advances_position() {
        let track = stereo_track(10);
        track.set_started(true);

        let mut out = [0.0f32; 6];
        track.fill(&mut out);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(track.position(), Some(Timestamp::from_micros(3_000)));
    }

    #[test]
    fn test_paused_outputs_silence() {
        let track = stereo_track(10);
        track.set_paused(true);

        let mut out = [9.0f32; 4];
        track.fill(&mut out);
        assert_eq!(out, [0.0; 4]);

        track.set_paused(false);
        track.set_started(true);
        assert_eq!(track.position(), Some(Timestamp::ZERO));
    }

    #[test]
    fn test_seek_and_end_of_track() {
        let track = stereo_track(10);
        track.set_started(true);

        track.seek(Timestamp::from_micros(8_000));
        let mut out = [1.0f32; 6];
        track.fill(&mut out);
        assert_eq!(out, [16.0, 17.0, 18.0, 19.0, 0.0, 0.0]);
        assert_eq!(track.position(), None);
    }

    #[test]
    fn test_quad_binaural_mix() {
        // one frame: left channels 1..4, right channels 10..40
        let samples = vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let track = AudioTrack::new(samples, AudioLayout::QuadBinaural, 1000);
        track.set_direction(FRAC_PI_2 / 2.0);

        let mut out = [0.0f32; 2];
        track.fill(&mut out);
        assert!((out[0] - 1.5).abs() < 1e-5);
        assert!((out[1] - 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_position_unavailable_before_start() {
        let track = stereo_track(10);
        assert_eq!(track.position(), None);
        assert_eq!(track.duration(), Timestamp::from_micros(10_000));
    }
}
