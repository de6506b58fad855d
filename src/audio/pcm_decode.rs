use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Loads the fixed-format WAV produced by the decode step into an f32 sample
/// buffer plus its sample rate. A file with zero audio frames yields an empty
/// buffer, not an error.
pub(crate) fn pcm_decode(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("probe container")?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("unknown sample rate"))?;
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("build codec")?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(anyhow!("read packet: {e}")),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).context("decode packet")?;
        let num_frames = decoded.frames();
        if num_frames == 0 {
            continue;
        }

        let mut buf = SampleBuffer::<f32>::new(num_frames as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        if channels > 1 {
            for frame in buf.samples().chunks(channels) {
                samples.push(frame.iter().sum::<f32>() / channels as f32);
            }
        } else {
            samples.extend_from_slice(buf.samples());
        }
    }

    Ok((samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav_fixture::build_wav;
    use std::io::Write;

    fn write_temp_wav(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".wav")
            .tempfile()
            .unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn given_mono_wav_when_decoding_then_returns_all_samples_and_rate() {
        let wav = build_wav(16_000, &vec![1000i16; 1600]);
        let file = write_temp_wav(&wav);

        let (samples, rate) = pcm_decode(file.path()).unwrap();

        assert_eq!(rate, 16_000);
        assert_eq!(samples.len(), 1600);
        assert!(samples.iter().all(|s| (*s - 1000.0 / 32768.0).abs() < 1e-3));
    }

    #[test]
    fn given_wav_with_no_frames_when_decoding_then_returns_empty_buffer() {
        let wav = build_wav(16_000, &[]);
        let file = write_temp_wav(&wav);

        let (samples, rate) = pcm_decode(file.path()).unwrap();

        assert_eq!(rate, 16_000);
        assert!(samples.is_empty());
    }

    #[test]
    fn given_garbage_bytes_when_decoding_then_returns_error() {
        let file = write_temp_wav(&[0xFFu8; 64]);

        assert!(pcm_decode(file.path()).is_err());
    }
}
