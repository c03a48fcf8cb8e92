//! Deterministic in-memory media source for tests

use std::collections::HashSet;

use super::{DecodeStatus, MediaSource, StreamInfo};
use crate::pipeline::frame_pool::FrameBuffer;
use crate::pipeline::types::TimeBase;

/// 25 fps stream in a 1/1000 time base with a fixed keyframe interval.
///
/// Each frame's raster is filled with its index (mod 256) so tests can
/// tell frames apart.
pub struct SyntheticSource {
    frames: i64,
    keyframe_interval: i64,
    next: i64,
    failing: HashSet<i64>,
    broken_after: Option<i64>,
    decoded: i64,
    width: u32,
    height: u32,
}

impl SyntheticSource {
    pub const TIME_BASE: TimeBase = TimeBase::new(1, 1000);

    pub fn new(frames: i64, keyframe_interval: i64) -> Self {
        Self {
            frames,
            keyframe_interval: keyframe_interval.max(1),
            next: 0,
            failing: HashSet::new(),
            broken_after: None,
            decoded: 0,
            width: 4,
            height: 2,
        }
    }

    /// Frames at these indices fail to decode once and are skipped.
    pub fn failing_at(mut self, indices: &[i64]) -> Self {
        self.failing.extend(indices);
        self
    }

    /// Every decode after `frames` successful ones fails.
    pub fn broken_after(mut self, frames: i64) -> Self {
        self.broken_after = Some(frames);
        self
    }

    pub fn ticks_per_frame(&self) -> i64 {
        40
    }
}

impl MediaSource for SyntheticSource {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            time_base: Self::TIME_BASE,
            duration_ticks: self.frames * self.ticks_per_frame(),
            frame_count: self.frames,
            width: self.width,
            height: self.height,
        }
    }

    fn decode_next(&mut self, dest: &mut FrameBuffer) -> anyhow::Result<DecodeStatus> {
        if self.broken_after.is_some_and(|limit| self.decoded >= limit) {
            anyhow::bail!("corrupt packet");
        }
        if self.next >= self.frames {
            return Ok(DecodeStatus::EndOfStream);
        }

        let index = self.next;
        self.next += 1;
        if self.failing.remove(&index) {
            anyhow::bail!("corrupt packet at frame {}", index);
        }

        dest.data_mut().fill(index as u8);
        dest.pts = index * self.ticks_per_frame();
        dest.duration = self.ticks_per_frame();
        self.decoded += 1;
        Ok(DecodeStatus::Frame)
    }

    fn seek(&mut self, target_ticks: i64) -> anyhow::Result<()> {
        let frame = (target_ticks / self.ticks_per_frame()).clamp(0, self.frames);
        self.next = frame - frame % self.keyframe_interval;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
