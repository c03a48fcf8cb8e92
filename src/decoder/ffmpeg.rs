use std::fs::File;
use std::path::Path;

use ac_ffmpeg::codec::Decoder as _;
use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::scaler::{Algorithm, VideoFrameScaler};
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame};
use ac_ffmpeg::codec::VideoCodecParameters;
use ac_ffmpeg::format::demuxer::{Demuxer, SeekTarget};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::time::{TimeBase as FfTimeBase, Timestamp as FfTimestamp};
use anyhow::{Context, anyhow};

use super::{DecodeStatus, MediaSource, StreamInfo};
use crate::pipeline::frame_pool::FrameBuffer;
use crate::pipeline::types::TimeBase;

/// Demuxer plus video decoder for one container file.
///
/// Frames are converted to packed RGB24 at the stream's native size.
pub struct FfmpegSource {
    demuxer: Demuxer<File>,
    stream_index: usize,
    parameters: VideoCodecParameters,
    ff_time_base: FfTimeBase,
    decoder: VideoDecoder,
    scaler: Option<ScalerState>,
    info: StreamInfo,
    /// Demuxer ran dry and the decoder was flushed; only buffered frames remain
    draining: bool,
    last_pts: Option<i64>,
    /// Duration of the last video packet pushed, in stream ticks
    packet_duration: i64,
}

struct ScalerState {
    scaler: VideoFrameScaler,
    width: usize,
    height: usize,
}

// The FFmpeg contexts are only ever used from the decode thread that owns them.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    /// Open a container and its first video stream.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).context("unable to open file")?;
        let io = IO::from_seekable_read_stream(file);

        let demuxer = Demuxer::builder()
            .build(io)
            .context("unable to parse container")?
            .find_stream_info(None)
            .map_err(|(_, e)| e)
            .context("unable to read stream info")?;

        let (stream_index, stream) = demuxer
            .streams()
            .iter()
            .enumerate()
            .find(|(_, stream)| stream.codec_parameters().is_video_codec())
            .ok_or_else(|| anyhow!("no video stream"))?;

        let codec_parameters = stream.codec_parameters();
        let parameters = codec_parameters
            .as_video_codec_parameters()
            .ok_or_else(|| anyhow!("no video stream"))?
            .clone();

        let ff_time_base = stream.time_base();
        let decoder = VideoDecoder::from_stream(stream)
            .context("unsupported video codec")?
            .build()
            .context("unsupported video codec")?;

        let duration = stream.duration();
        let duration_ticks = if duration.is_null() {
            0
        } else {
            duration.with_time_base(ff_time_base).timestamp().max(0)
        };

        let info = StreamInfo {
            time_base: TimeBase::new(ff_time_base.num(), ff_time_base.den()),
            duration_ticks,
            frame_count: stream.frames().map(|n| n as i64).unwrap_or(0),
            width: parameters.width() as u32,
            height: parameters.height() as u32,
        };

        Ok(Self {
            demuxer: demuxer.into_demuxer(),
            stream_index,
            parameters,
            ff_time_base,
            decoder,
            scaler: None,
            info,
            draining: false,
            last_pts: None,
            packet_duration: 0,
        })
    }

    /// Pull the next decoded (not yet converted) frame.
    fn next_video_frame(&mut self) -> anyhow::Result<Option<VideoFrame>> {
        loop {
            if let Some(frame) = self.decoder.take()? {
                return Ok(Some(frame));
            }
            if self.draining {
                return Ok(None);
            }

            match self.demuxer.take()? {
                Some(packet) if packet.stream_index() == self.stream_index => {
                    let duration = packet.raw_duration();
                    if duration > 0 {
                        self.packet_duration = duration;
                    }
                    self.decoder.push(packet)?;
                }
                Some(_) => {}
                None => {
                    self.decoder.flush()?;
                    self.draining = true;
                }
            }
        }
    }

    fn scaler_for(&mut self, frame: &VideoFrame) -> anyhow::Result<&mut VideoFrameScaler> {
        let (width, height) = (frame.width(), frame.height());
        let stale = self
            .scaler
            .as_ref()
            .is_none_or(|state| state.width != width || state.height != height);

        if stale {
            let scaler = VideoFrameScaler::builder()
                .source_pixel_format(frame.pixel_format())
                .source_width(width)
                .source_height(height)
                .target_pixel_format(get_pixel_format("rgb24"))
                .target_width(self.info.width as usize)
                .target_height(self.info.height as usize)
                .algorithm(Algorithm::Bilinear)
                .build()
                .context("unable to create scaler")?;
            self.scaler = Some(ScalerState {
                scaler,
                width,
                height,
            });
        }

        self.scaler
            .as_mut()
            .map(|state| &mut state.scaler)
            .ok_or_else(|| anyhow!("scaler unavailable"))
    }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn decode_next(&mut self, dest: &mut FrameBuffer) -> anyhow::Result<DecodeStatus> {
        let Some(frame) = self.next_video_frame()? else {
            return Ok(DecodeStatus::EndOfStream);
        };

        let pts = frame.pts();
        let rgb = self.scaler_for(&frame)?.scale(&frame)?;

        let stride = dest.stride();
        let height = dest.height() as usize;
        let plane = &rgb.planes()[0];
        extract_plane(dest.data_mut(), plane.data(), plane.line_size(), stride, height);

        let pts = if pts.is_null() {
            self.last_pts.map_or(0, |last| last + 1)
        } else {
            pts.with_time_base(self.ff_time_base).timestamp()
        };
        dest.pts = pts;
        dest.duration = frame_duration(self.packet_duration, &self.info);
        self.last_pts = Some(pts);

        Ok(DecodeStatus::Frame)
    }

    fn seek(&mut self, target_ticks: i64) -> anyhow::Result<()> {
        self.demuxer
            .seek_to_timestamp(
                FfTimestamp::new(target_ticks, self.ff_time_base),
                SeekTarget::UpTo,
            )
            .context("demuxer seek failed")?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        // a fresh decoder drops every buffered reference frame
        self.decoder = VideoDecoder::from_codec_parameters(&self.parameters)?
            .time_base(self.ff_time_base)
            .build()?;
        self.draining = false;
        self.last_pts = None;
        Ok(())
    }
}

/// Ticks a frame stays on screen: the packet duration when the container
/// provides one, otherwise the stream's nominal frame period (0 if unknown).
fn frame_duration(packet_duration: i64, info: &StreamInfo) -> i64 {
    if packet_duration > 0 {
        packet_duration
    } else if info.duration_ticks > 0 && info.frame_count > 0 {
        info.duration_ticks / info.frame_count
    } else {
        0
    }
}

/// Copy `height` rows of `width` bytes from a padded source into a packed destination.
#[inline]
fn extract_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    let total_src = height * stride;

    // Fast path: No stride padding
    if stride == width && src.len() >= total_src && dst.len() >= total_src {
        dst[..total_src].copy_from_slice(&src[..total_src]);
        return;
    }

    for r in 0..height {
        let src_start = r * stride;
        let dst_start = r * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}
