use std::io::Cursor;
use std::path::Path;

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;

use crate::inference::error::{Result, TranscribeError};

fn conv<T>(samples: &mut Vec<f32>, data: &symphonia::core::audio::AudioBuffer<T>)
where
    T: symphonia::core::sample::Sample,
    f32: FromSample<T>,
{
    let channels = data.spec().channels.count();
    if channels == 1 {
        samples.extend(data.chan(0).iter().map(|v| f32::from_sample(*v)));
        return;
    }
    // Downmix by averaging; the engine only consumes mono.
    let frames = data.frames();
    for frame in 0..frames {
        let mut acc = 0f32;
        for channel in 0..channels {
            acc += f32::from_sample(data.chan(channel)[frame]);
        }
        samples.push(acc / channels as f32);
    }
}

/// Decodes a container (WAV, FLAC, MP3, OGG, ...) into mono f32 PCM and
/// returns the stream's sample rate. Rate conversion is the caller's job.
pub fn pcm_decode_bytes(input: Box<[u8]>) -> Result<(Vec<f32>, u32)> {
    let cursor = Cursor::new(input);
    pcm_decode(Box::new(cursor))
}

pub fn pcm_decode_file<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    let file = std::fs::File::open(path.as_ref()).map_err(|e| {
        TranscribeError::AudioProcessingFailed(format!(
            "{}: {e}",
            path.as_ref().display()
        ))
    })?;
    pcm_decode(Box::new(file))
}

fn pcm_decode(source: Box<dyn MediaSource>) -> Result<(Vec<f32>, u32)> {
    let audio_err =
        |e: symphonia::core::errors::Error| TranscribeError::AudioProcessingFailed(e.to_string());

    let mss = MediaSourceStream::new(source, MediaSourceStreamOptions::default());
    let hint = symphonia::core::probe::Hint::new();
    let meta_opts = MetadataOptions::default();
    let fmt_opts = FormatOptions::default();

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(audio_err)?;
    let mut format = probed.format;

    // Find the first audio track with a known (decodeable) codec.
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| TranscribeError::AudioProcessingFailed("no supported audio tracks".into()))?;

    let dec_opts = DecoderOptions::default();
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &dec_opts)
        .map_err(audio_err)?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut pcm_data = Vec::new();
    while let Ok(packet) = format.next_packet() {
        // Consume any new metadata that has been read since the last packet.
        while !format.metadata().is_latest() {
            format.metadata().pop();
        }
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet).map_err(audio_err)? {
            AudioBufferRef::F32(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::U8(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::U16(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::U24(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::U32(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::S8(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::S16(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::S24(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::S32(data) => conv(&mut pcm_data, &data),
            AudioBufferRef::F64(data) => conv(&mut pcm_data, &data),
        }
    }
    Ok((pcm_data, sample_rate))
}
