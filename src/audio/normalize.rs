use std::io::Write;
use std::path::Path;
use std::process::Command;

use crate::audio::pcm_decode::pcm_decode;
use crate::error::ServiceError;

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// How much of ffmpeg's stderr is kept when decoding fails. The useful part
/// is at the end of the stream.
const MAX_DIAGNOSTIC_BYTES: usize = 2048;

/// Mono 16 kHz sample buffer as consumed by the inference engine. Immutable
/// once produced.
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl NormalizedAudio {
    pub fn duration_s(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Converts an arbitrary audio byte stream into [`NormalizedAudio`] with a
/// single ffmpeg invocation. The blocking work (temp files, subprocess, WAV
/// load) runs on the blocking thread pool.
pub async fn normalize(bytes: Vec<u8>, filename_hint: &str) -> Result<NormalizedAudio, ServiceError> {
    let suffix = container_suffix(filename_hint);
    tokio::task::spawn_blocking(move || {
        decode_via_ffmpeg(&bytes, &suffix, &std::env::temp_dir())
    })
    .await
    .map_err(|e| ServiceError::Decode(format!("decode task failed: {e}")))?
}

/// One deterministic decode attempt: input bytes land in a scoped temp file,
/// ffmpeg is forced to mono/16 kHz/WAV, and the result is loaded back into
/// memory. Both temp files are removed on every exit path, including panics,
/// because they are owned by `NamedTempFile` guards.
fn decode_via_ffmpeg(
    bytes: &[u8],
    suffix: &str,
    scratch_dir: &Path,
) -> Result<NormalizedAudio, ServiceError> {
    let mut input = tempfile::Builder::new()
        .prefix("hviske-in-")
        .suffix(suffix)
        .tempfile_in(scratch_dir)
        .map_err(|e| ServiceError::Decode(format!("create temp input: {e}")))?;
    input
        .write_all(bytes)
        .map_err(|e| ServiceError::Decode(format!("write temp input: {e}")))?;
    input
        .flush()
        .map_err(|e| ServiceError::Decode(format!("write temp input: {e}")))?;

    let output = tempfile::Builder::new()
        .prefix("hviske-out-")
        .suffix(".wav")
        .tempfile_in(scratch_dir)
        .map_err(|e| ServiceError::Decode(format!("create temp output: {e}")))?;

    let result = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input.path())
        .args(["-ar", &TARGET_SAMPLE_RATE.to_string(), "-ac", "1", "-f", "wav"])
        .arg(output.path())
        .output()
        .map_err(|e| ServiceError::Decode(format!("failed to run ffmpeg: {e}")))?;

    if !result.status.success() {
        return Err(ServiceError::Decode(diagnostic_tail(&result.stderr)));
    }

    let (samples, sample_rate) =
        pcm_decode(output.path()).map_err(|e| ServiceError::Decode(e.to_string()))?;
    Ok(NormalizedAudio {
        samples,
        sample_rate,
    })
}

/// Logs a warning when ffmpeg is not runnable; the first upload would fail
/// with a decode error otherwise, which is a confusing way to find out.
pub fn check_ffmpeg_binary() {
    let available = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !available {
        tracing::warn!("ffmpeg not found on PATH, audio decoding will fail");
    }
}

/// The advisory filename only contributes its suffix, which ffmpeg may use
/// to pick a demuxer for its input.
fn container_suffix(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(char::is_alphanumeric))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| ".audio".to_string())
}

fn diagnostic_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let tail_start = text
        .char_indices()
        .rev()
        .take(MAX_DIAGNOSTIC_BYTES)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[tail_start..].to_string()
}
