pub mod normalize;
pub(crate) mod pcm_decode;

pub use normalize::{check_ffmpeg_binary, normalize, NormalizedAudio, TARGET_SAMPLE_RATE};

#[cfg(test)]
pub(crate) mod wav_fixture {
    /// Minimal 16-bit PCM WAV writer for decode fixtures.
    pub(crate) fn build_wav(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let num_samples = samples.len() as u32;
        let byte_rate = sample_rate * 2;
        let data_size = num_samples * 2;
        let file_size = 36 + data_size;

        let mut wav = Vec::with_capacity(44 + data_size as usize);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&file_size.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&sample_rate.to_le_bytes());
        wav.extend_from_slice(&byte_rate.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes()); // block align
        wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_size.to_le_bytes());
        for &s in samples {
            wav.extend_from_slice(&s.to_le_bytes());
        }
        wav
    }
}
