//! Up-front decoding of a file's audio track into memory

use std::fs::File;
use std::path::Path;

use ac_ffmpeg::codec::Decoder as _;
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioDecoder, AudioFrame, AudioResampler, ChannelLayout};
use ac_ffmpeg::format::demuxer::Demuxer;
use ac_ffmpeg::format::io::IO;
use anyhow::{Context, anyhow};

use crate::assets::DEFAULT_SAMPLE_RATE;
use crate::audio::{AudioLayout, AudioTrack};

/// Decode the first audio stream of `path` to interleaved f32 samples.
///
/// A quad-binaural request on a track with fewer than eight channels falls
/// back to stereo.
pub fn load_track(path: &Path, layout: AudioLayout) -> anyhow::Result<AudioTrack> {
    let file = File::open(path).context("unable to open file")?;
    let mut demuxer = Demuxer::builder()
        .build(IO::from_seekable_read_stream(file))
        .context("unable to parse container")?
        .find_stream_info(None)
        .map_err(|(_, e)| e)
        .context("unable to read stream info")?;

    let (stream_index, stream) = demuxer
        .streams()
        .iter()
        .enumerate()
        .find(|(_, stream)| stream.codec_parameters().is_audio_codec())
        .ok_or_else(|| anyhow!("no audio stream"))?;

    let codec_parameters = stream.codec_parameters();
    let parameters = codec_parameters
        .as_audio_codec_parameters()
        .ok_or_else(|| anyhow!("no audio stream"))?;

    let source_channels = parameters.channel_layout().channels() as usize;
    let layout = match layout {
        AudioLayout::QuadBinaural if source_channels < 8 => {
            log::warn!(
                "Audio: quad-binaural needs 8 channels, found {}; using stereo",
                source_channels
            );
            AudioLayout::Stereo
        }
        layout => layout,
    };

    let sample_rate = match parameters.sample_rate() {
        0 => DEFAULT_SAMPLE_RATE,
        rate => rate,
    };

    let mut decoder = AudioDecoder::from_stream(stream)
        .context("unsupported audio codec")?
        .build()
        .context("unsupported audio codec")?;

    let target_layout = ChannelLayout::from_channels(layout.channels() as u32)
        .ok_or_else(|| anyhow!("no channel layout for {} channels", layout.channels()))?;
    let mut resampler = AudioResampler::builder()
        .source_channel_layout(parameters.channel_layout().to_owned())
        .source_sample_format(parameters.sample_format())
        .source_sample_rate(parameters.sample_rate())
        .target_channel_layout(target_layout)
        .target_sample_format(get_sample_format("flt"))
        .target_sample_rate(sample_rate)
        .build()
        .context("unsupported audio format")?;

    let mut samples = Vec::new();
    let mut failures = 0u64;

    while let Some(packet) = demuxer.take()? {
        if packet.stream_index() != stream_index {
            continue;
        }
        if let Err(e) = decoder.push(packet) {
            failures += 1;
            log::debug!("Audio: packet decode failed: {}", e);
            continue;
        }
        drain(&mut decoder, &mut resampler, &mut samples, layout)?;
    }

    decoder.flush()?;
    drain(&mut decoder, &mut resampler, &mut samples, layout)?;
    resampler.flush()?;
    while let Some(frame) = resampler.take()? {
        append_packed(&mut samples, &frame, layout.channels());
    }

    if failures > 0 {
        log::warn!("Audio: {} packets failed to decode", failures);
    }
    if samples.is_empty() {
        return Err(anyhow!("audio stream decoded to nothing"));
    }

    log::info!(
        "Audio: decoded {} frames at {} Hz ({:?})",
        samples.len() / layout.channels(),
        sample_rate,
        layout
    );

    Ok(AudioTrack::new(samples, layout, sample_rate))
}

fn drain(
    decoder: &mut AudioDecoder,
    resampler: &mut AudioResampler,
    samples: &mut Vec<f32>,
    layout: AudioLayout,
) -> anyhow::Result<()> {
    while let Some(frame) = decoder.take()? {
        resampler.push(frame)?;
        while let Some(resampled) = resampler.take()? {
            append_packed(samples, &resampled, layout.channels());
        }
    }
    Ok(())
}

/// Append a packed `flt` frame's samples.
fn append_packed(out: &mut Vec<f32>, frame: &AudioFrame, channels: usize) {
    let planes = frame.planes();
    let Some(plane) = planes.first() else {
        return;
    };
    let wanted = frame.samples() * channels * std::mem::size_of::<f32>();
    let data = &plane.data()[..wanted.min(plane.data().len())];
    append_ne_f32(out, data);
}

fn append_ne_f32(out: &mut Vec<f32>, data: &[u8]) {
    out.extend(
        data.chunks_exact(4)
            .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_ne_f32() {
        let mut out = vec![];
        let bytes: Vec<u8> = [0.5f32, -1.0, 0.25]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .chain([1, 2])
            .collect();

        append_ne_f32(&mut out, &bytes);
        assert_eq!(out, vec![0.5, -1.0, 0.25]);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_track(Path::new("/nonexistent.mp4"), AudioLayout::Stereo).is_err());
    }
}
