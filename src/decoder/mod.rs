//! Video decoding engine
//!
//! A dedicated thread pulls fillable rasters from the frame pool, decodes
//! the next video frame into them and publishes them as showable. Seeks are
//! requested from the presentation thread and carried out by the decode
//! thread on its next iteration; the codec session itself is never touched
//! from outside that thread.

mod ffmpeg;

pub mod audio;
#[cfg(test)]
pub mod synthetic;

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use anyhow::Context;

use crate::assets::{DECODER_WAIT, MAX_CONSECUTIVE_DECODE_FAILURES};
use crate::audio::{AudioLayout, AudioTrack};
use crate::pipeline::frame_pool::{DecodedFrame, FrameBuffer, FramePool};
use crate::pipeline::health::PlaybackHealth;
use crate::pipeline::types::{TimeBase, Timestamp};

use ffmpeg::FfmpegSource;

/// Properties of the opened video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub time_base: TimeBase,
    /// Stream duration in ticks, 0 when unknown
    pub duration_ticks: i64,
    /// Number of frames, 0 when unknown
    pub frame_count: i64,
    pub width: u32,
    pub height: u32,
}

impl StreamInfo {
    pub fn duration(&self) -> Timestamp {
        self.time_base.ticks_to_timestamp(self.duration_ticks)
    }

    /// Nominal time between frames, when both duration and frame count are known.
    pub fn frame_period(&self) -> Option<Timestamp> {
        if self.duration_ticks > 0 && self.frame_count > 0 {
            Some(Timestamp::from_micros(
                self.duration().micros / self.frame_count,
            ))
        } else {
            None
        }
    }
}

/// Outcome of decoding one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The destination raster holds a new frame, its `pts` stamped
    Frame,
    /// The demuxer ran dry
    EndOfStream,
}

/// Codec session driven by the decode thread.
pub trait MediaSource: Send {
    fn info(&self) -> StreamInfo;

    /// Decode the next video frame into `dest`, converting to RGB8.
    ///
    /// An error covers a single packet or frame; the caller may keep
    /// decoding afterwards.
    fn decode_next(&mut self, dest: &mut FrameBuffer) -> anyhow::Result<DecodeStatus>;

    /// Reposition the demuxer at or before `target_ticks` (nearest keyframe).
    fn seek(&mut self, target_ticks: i64) -> anyhow::Result<()>;

    /// Drop frames buffered inside the codec.
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// Decoder settings chosen by the caller
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// Number of rasters in the pool
    pub pool_capacity: usize,
    /// Restart from zero at end of stream
    pub looping: bool,
    /// Pre-decode the audio track with this layout
    pub audio: Option<AudioLayout>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            pool_capacity: crate::assets::FRAME_POOL_CAPACITY,
            looping: false,
            audio: None,
        }
    }
}

/// A seek waiting for the decode thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeekRequest {
    /// Target in stream ticks
    target: i64,
    generation: u64,
}

#[derive(Debug, Default)]
struct DecoderFlags {
    exit: bool,
    decoded_all: bool,
    looping: bool,
    seek: Option<SeekRequest>,
    /// Number of seeks requested so far
    generation: u64,
}

struct DecoderShared {
    pool: FramePool,
    flags: Mutex<DecoderFlags>,
    /// Signaled on seek and quit, for a thread idling after end of stream
    command_ready: Condvar,
    health: Arc<PlaybackHealth>,
}

impl DecoderShared {
    fn flags(&self) -> MutexGuard<'_, DecoderFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exiting(&self) -> bool {
        self.flags().exit
    }

    fn take_seek(&self) -> Option<SeekRequest> {
        self.flags().seek.take()
    }
}

/// Handle to a running decode thread and its frame pool
pub struct Decoder {
    shared: Arc<DecoderShared>,
    info: StreamInfo,
    audio: Option<Arc<AudioTrack>>,
    thread: Option<JoinHandle<()>>,
}

impl Decoder {
    /// Open `path`, pre-decode its audio if requested, and start decoding.
    pub fn open(
        path: &Path,
        options: DecoderOptions,
        health: Arc<PlaybackHealth>,
    ) -> anyhow::Result<Self> {
        let source = FfmpegSource::open(path)
            .with_context(|| format!("unable to open video {}", path.display()))?;

        let audio = match options.audio {
            Some(layout) => match audio::load_track(path, layout) {
                Ok(track) => Some(Arc::new(track)),
                Err(e) => {
                    log::warn!("Decoder: audio disabled: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let mut decoder = Self::start(Box::new(source), options, health)?;
        decoder.audio = audio;
        Ok(decoder)
    }

    /// Start the decode thread over an already opened source.
    pub fn start(
        source: Box<dyn MediaSource>,
        options: DecoderOptions,
        health: Arc<PlaybackHealth>,
    ) -> anyhow::Result<Self> {
        let info = source.info();
        log::info!(
            "Decoder: {}x{}, time base {}, duration {} ticks ({:.2}s), {} frames",
            info.width,
            info.height,
            info.time_base,
            info.duration_ticks,
            info.duration().as_secs_f64(),
            info.frame_count
        );

        let shared = Arc::new(DecoderShared {
            pool: FramePool::new(options.pool_capacity, info.width, info.height),
            flags: Mutex::new(DecoderFlags {
                looping: options.looping,
                ..Default::default()
            }),
            command_ready: Condvar::new(),
            health,
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("decoder".into())
                .spawn(move || DecodeLoop::new(shared, source).run())
                .context("unable to spawn decoder thread")?
        };

        Ok(Self {
            shared,
            info,
            audio: None,
            thread: Some(thread),
        })
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    pub fn time_base(&self) -> TimeBase {
        self.info.time_base
    }

    /// Pre-decoded audio, when requested and available
    pub fn audio(&self) -> Option<Arc<AudioTrack>> {
        self.audio.clone()
    }

    /// Ask the decode thread to seek to `target_ticks`.
    ///
    /// Returns immediately with the seek's generation; the first frame
    /// published after the seek carries it in `seek_result`. A newer request
    /// supersedes one the thread has not started yet. Clears the
    /// end-of-stream flag.
    pub fn request_seek(&self, target_ticks: i64) -> u64 {
        let generation = {
            let mut flags = self.shared.flags();
            flags.generation += 1;
            flags.seek = Some(SeekRequest {
                target: target_ticks,
                generation: flags.generation,
            });
            flags.decoded_all = false;
            flags.generation
        };
        self.shared.command_ready.notify_all();
        self.shared.pool.wake();
        generation
    }

    /// [`Decoder::request_seek`] with a stream time in microseconds.
    pub fn seek_to(&self, target: Timestamp) -> u64 {
        self.request_seek(self.info.time_base.timestamp_to_ticks(target))
    }

    /// Next showable frame, or `None` when decoding has fallen behind.
    pub fn get_frame(&self) -> Option<DecodedFrame> {
        self.shared.pool.pop_showable()
    }

    pub fn return_frame(&self, buffer: FrameBuffer) {
        self.shared.pool.return_buffer(buffer);
    }

    /// True once the stream has been decoded to the end and no seek is pending.
    pub fn decoded_all(&self) -> bool {
        self.shared.flags().decoded_all
    }

    pub fn pool(&self) -> &FramePool {
        &self.shared.pool
    }

    /// Ask the decode thread to exit; idempotent.
    pub fn set_quit(&self) {
        self.shared.flags().exit = true;
        self.shared.command_ready.notify_all();
        self.shared.pool.wake();
    }

    /// Wait for the decode thread to terminate. Call after [`Decoder::set_quit`].
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("Decoder: decode thread panicked");
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.set_quit();
        self.join();
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("info", &self.info)
            .field("pool", &self.shared.pool)
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

/// Decode loop steps; exit is checked before each one.
enum Step {
    AwaitingBuffer,
    Seeking { request: SeekRequest },
    Decoding { buffer: FrameBuffer },
    Publishing { buffer: FrameBuffer },
    DrainingEof { buffer: FrameBuffer },
    /// End of stream reached; idle until a seek or quit
    Finished,
}

struct DecodeLoop {
    shared: Arc<DecoderShared>,
    source: Box<dyn MediaSource>,
    /// Mark the next published frame as a seek result
    landing: bool,
    /// Generation of the last seek carried out
    generation: u64,
    consecutive_failures: u32,
    /// Frames decoded since the last (re)start, to detect empty loops
    decoded_since_restart: u64,
}

impl DecodeLoop {
    fn new(shared: Arc<DecoderShared>, source: Box<dyn MediaSource>) -> Self {
        Self {
            shared,
            source,
            landing: false,
            generation: 0,
            consecutive_failures: 0,
            decoded_since_restart: 0,
        }
    }

    fn run(mut self) {
        let mut step = Step::AwaitingBuffer;

        loop {
            if self.shared.exiting() {
                if let Some(buffer) = step.into_buffer() {
                    self.shared.pool.return_buffer(buffer);
                }
                break;
            }
            step = self.advance(step);
        }

        log::debug!("Decoder: decode thread exiting");
    }

    fn advance(&mut self, step: Step) -> Step {
        match step {
            Step::AwaitingBuffer => {
                if let Some(request) = self.shared.take_seek() {
                    return Step::Seeking { request };
                }
                match self.shared.pool.wait_fillable(DECODER_WAIT) {
                    Some(buffer) => Step::Decoding { buffer },
                    None => Step::AwaitingBuffer,
                }
            }

            Step::Seeking { request } => {
                self.perform_seek(request);
                Step::AwaitingBuffer
            }

            Step::Decoding { mut buffer } => {
                if let Some(request) = self.shared.take_seek() {
                    self.shared.pool.return_buffer(buffer);
                    return Step::Seeking { request };
                }

                match self.source.decode_next(&mut buffer) {
                    Ok(DecodeStatus::Frame) => {
                        self.consecutive_failures = 0;
                        self.decoded_since_restart += 1;
                        self.shared.health.record_decoded();
                        Step::Publishing { buffer }
                    }
                    Ok(DecodeStatus::EndOfStream) => Step::DrainingEof { buffer },
                    Err(e) => {
                        self.consecutive_failures += 1;
                        self.shared.health.record_decode_failure();
                        log::warn!(
                            "Decoder: decode failed ({}/{}): {:#}",
                            self.consecutive_failures,
                            MAX_CONSECUTIVE_DECODE_FAILURES,
                            e
                        );
                        if self.consecutive_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                            log::error!("Decoder: too many consecutive failures, treating as end of stream");
                            self.consecutive_failures = 0;
                            Step::DrainingEof { buffer }
                        } else {
                            Step::Decoding { buffer }
                        }
                    }
                }
            }

            Step::Publishing { buffer } => {
                let flags = self.shared.flags();
                if flags.seek.is_some() {
                    // stale: the seek will discard it anyway
                    drop(flags);
                    self.shared.pool.return_buffer(buffer);
                    return Step::AwaitingBuffer;
                }
                self.shared.pool.publish_showable(DecodedFrame {
                    buffer,
                    seek_result: std::mem::take(&mut self.landing).then_some(self.generation),
                });
                drop(flags);
                Step::AwaitingBuffer
            }

            Step::DrainingEof { buffer } => {
                let looping = self.shared.flags().looping;
                if looping && self.decoded_since_restart > 0 {
                    log::info!("Decoder: end of stream, looping to start");
                    self.restart();
                    return Step::Decoding { buffer };
                }

                self.shared.pool.return_buffer(buffer);
                let mut flags = self.shared.flags();
                if let Some(request) = flags.seek.take() {
                    return Step::Seeking { request };
                }
                flags.decoded_all = true;
                log::info!("Decoder: all frames decoded");
                Step::Finished
            }

            Step::Finished => {
                let flags = self.shared.flags();
                let (mut flags, _timeout) = self
                    .shared
                    .command_ready
                    .wait_timeout_while(flags, DECODER_WAIT, |flags| {
                        !flags.exit && flags.seek.is_none()
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                match flags.seek.take() {
                    Some(request) => Step::Seeking { request },
                    None => Step::Finished,
                }
            }
        }
    }

    /// Seek the source, discard queued frames and flush the codec.
    fn perform_seek(&mut self, request: SeekRequest) {
        let SeekRequest { target, generation } = request;
        log::debug!("Decoder: seek #{} to {} ticks", generation, target);

        if let Err(e) = self.source.seek(target) {
            log::warn!("Decoder: seek to {} failed: {:#}", target, e);
        }
        let discarded = self.shared.pool.recycle_showable();
        self.shared.health.record_discarded(discarded);
        if let Err(e) = self.source.flush() {
            log::warn!("Decoder: flush failed: {:#}", e);
        }

        self.landing = true;
        self.generation = generation;
        self.consecutive_failures = 0;
        self.decoded_since_restart = 0;
    }

    /// Loop back to time zero without discarding frames still queued.
    ///
    /// The first frame of the new pass answers the last seek again.
    fn restart(&mut self) {
        if let Err(e) = self.source.seek(0) {
            log::warn!("Decoder: loop restart failed: {:#}", e);
        }
        if let Err(e) = self.source.flush() {
            log::warn!("Decoder: flush failed: {:#}", e);
        }
        self.landing = true;
        self.decoded_since_restart = 0;
    }
}

impl Step {
    fn into_buffer(self) -> Option<FrameBuffer> {
        match self {
            Step::Decoding { buffer }
            | Step::Publishing { buffer }
            | Step::DrainingEof { buffer } => Some(buffer),
            Step::AwaitingBuffer | Step::Seeking { .. } | Step::Finished => None,
        }
    }
}
