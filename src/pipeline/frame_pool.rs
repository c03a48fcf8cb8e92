//! Fixed-capacity raster pool shared by the decode thread and the player
//!
//! Every buffer lives in exactly one place at a time:
//! - `fillable`: owned by the decoder, free to be overwritten
//! - `showable`: decoded and queued in presentation order
//! - in flight: popped by a consumer (player, renderer) and not yet returned
//!
//! The pool never allocates after construction, so
//! `fillable + showable + in_flight == capacity` holds at all times.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bytes per RGB8 pixel.
pub const RGB_BYTES_PER_PIXEL: usize = 3;

/// One RGB8 raster plus its timing, in stream time-base ticks.
pub struct FrameBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// Presentation timestamp in stream ticks
    pub pts: i64,
    /// Duration hint in stream ticks (0 when the container does not say)
    pub duration: i64,
}

impl FrameBuffer {
    /// Allocate a mid-grey raster of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![128u8; width as usize * height as usize * RGB_BYTES_PER_PIXEL],
            width,
            height,
            pts: 0,
            duration: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, without padding
    pub fn stride(&self) -> usize {
        self.width as usize * RGB_BYTES_PER_PIXEL
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .field("duration", &self.duration)
            .finish()
    }
}

/// A showable frame as handed to the consumer.
#[derive(Debug)]
pub struct DecodedFrame {
    pub buffer: FrameBuffer,
    /// Set on the first frame decoded after a seek or a loop restart, to the
    /// generation of the seek it answers. Its PTS may be discontinuous with
    /// the previous frame and must realign the clock.
    pub seek_result: Option<u64>,
}

/// Snapshot of where the pool's buffers currently are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub fillable: usize,
    pub showable: usize,
    pub in_flight: usize,
}

struct PoolQueues {
    fillable: VecDeque<FrameBuffer>,
    showable: VecDeque<DecodedFrame>,
}

/// Producer/consumer raster pool.
///
/// All operations take the single pool lock for the queue mutation only;
/// decoding and rendering happen on buffers the caller owns outright.
pub struct FramePool {
    queues: Mutex<PoolQueues>,
    /// Signaled whenever a buffer becomes fillable, or on `wake`
    fillable_ready: Condvar,
    capacity: usize,
    width: u32,
    height: u32,
}

impl FramePool {
    /// Pre-allocate `capacity` rasters of `width` x `height`.
    pub fn new(capacity: usize, width: u32, height: u32) -> Self {
        let fillable = (0..capacity)
            .map(|_| FrameBuffer::new(width, height))
            .collect::<VecDeque<_>>();

        Self {
            queues: Mutex::new(PoolQueues {
                fillable,
                showable: VecDeque::with_capacity(capacity),
            }),
            fillable_ready: Condvar::new(),
            capacity,
            width,
            height,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a writable buffer, or `None` if every buffer is queued or in flight.
    pub fn acquire_fillable(&self) -> Option<FrameBuffer> {
        self.lock().fillable.pop_front()
    }

    /// Take a writable buffer, waiting at most `timeout` for one to be returned.
    ///
    /// Returns `None` on timeout or when woken by [`FramePool::wake`] with the
    /// pool still empty, so the caller can re-check its exit flag.
    pub fn wait_fillable(&self, timeout: Duration) -> Option<FrameBuffer> {
        let mut queues = self.lock();
        if let Some(buffer) = queues.fillable.pop_front() {
            return Some(buffer);
        }

        let (mut queues, _timeout) = self
            .fillable_ready
            .wait_timeout(queues, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        queues.fillable.pop_front()
    }

    /// Append a decoded frame to the showable queue (decode order).
    pub fn publish_showable(&self, frame: DecodedFrame) {
        self.lock().showable.push_back(frame);
    }

    /// Pop the oldest showable frame without blocking.
    pub fn pop_showable(&self) -> Option<DecodedFrame> {
        self.lock().showable.pop_front()
    }

    /// Give a consumed buffer back to the decoder.
    pub fn return_buffer(&self, buffer: FrameBuffer) {
        {
            let mut queues = self.lock();
            debug_assert!(
                queues.fillable.len() + queues.showable.len() < self.capacity,
                "buffer returned to a full pool"
            );
            queues.fillable.push_back(buffer);
        }
        self.fillable_ready.notify_one();
    }

    /// Move every not-yet-consumed showable frame back to fillable.
    ///
    /// Used by the decoder when a seek invalidates queued frames. Returns the
    /// number of frames discarded.
    pub fn recycle_showable(&self) -> usize {
        let discarded = {
            let mut queues = self.lock();
            let PoolQueues { fillable, showable } = &mut *queues;
            let discarded = showable.len();
            fillable.extend(showable.drain(..).map(|frame| frame.buffer));
            discarded
        };
        if discarded > 0 {
            self.fillable_ready.notify_all();
        }
        discarded
    }

    /// Wake any thread blocked in [`FramePool::wait_fillable`].
    pub fn wake(&self) {
        let _guard = self.lock();
        self.fillable_ready.notify_all();
    }

    pub fn counts(&self) -> PoolCounts {
        let queues = self.lock();
        let fillable = queues.fillable.len();
        let showable = queues.showable.len();
        PoolCounts {
            fillable,
            showable,
            in_flight: self.capacity.saturating_sub(fillable + showable),
        }
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.capacity)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("counts", &self.counts())
            .finish()
    }
}
