#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::model::Whisper;
use candle_transformers::models::whisper::{
    self as m, audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SOT_TOKEN, TEMPERATURES,
    TRANSCRIBE_TOKEN, TRANSLATE_TOKEN,
};
use rand::distributions::Distribution;
use rand::SeedableRng;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::inference::multilingual;

/// Hard cap on generated tokens per decode call, independent of the model's
/// own positional limit.
const MAX_NEW_TOKENS: usize = 448;

/// Language identification only consults this much audio from the start of
/// the buffer.
const DETECT_WINDOW_S: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

impl Task {
    pub fn from_form(value: &str) -> Option<Self> {
        match value {
            "transcribe" => Some(Task::Transcribe),
            "translate" => Some(Task::Translate),
            _ => None,
        }
    }
}

/// One decoded window of audio.
#[derive(Debug, Clone)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    pub text: String,
    pub chunks: Vec<RawChunk>,
}

/// Timestamped fragment as reported by the engine; either edge may be absent
/// when the decoder emitted text outside a timestamp pair.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub text: String,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

#[derive(Debug, Clone)]
struct DecodingResult {
    tokens: Vec<u32>,
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
    compression_ratio: f64,
}

#[derive(Clone)]
pub struct AudioGeneratorPipeline {
    model: Whisper,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    device: Device,
    dtype: DType,
    suppress_tokens: Tensor,
    suppress_tokens_timestamped: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    translate_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    language_tokens: Vec<(&'static str, u32)>,
    frames_per_segment: usize,
    seed: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn from_safetensors(
        config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
        mel_filter_bytes: &[u8],
        device: &Device,
        dtype: DType,
        chunk_length_s: usize,
    ) -> Result<Self> {
        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow!("load tokenizer: {e}"))?;

        // SAFETY: the safetensors file is memory-mapped read-only.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        let model = Whisper::load(&vb, config.clone())?;

        let usable = mel_filter_bytes.len() / 4 * 4;
        let mut mel_filters = vec![0f32; usable / 4];
        <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(
            &mel_filter_bytes[..usable],
            &mut mel_filters,
        );

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let suppress_tokens = suppress_mask(&config, None, device)?;
        let suppress_tokens_timestamped =
            suppress_mask(&config, Some(no_timestamps_token), device)?;

        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let translate_token = token_id(&tokenizer, TRANSLATE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let no_speech_token = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok());
        let Some(no_speech_token) = no_speech_token else {
            bail!("Unable to find any non-speech token")
        };

        let language_tokens = multilingual::language_token_pairs(&tokenizer);
        let frames_per_segment =
            ((chunk_length_s * m::SAMPLE_RATE) / m::HOP_LENGTH).clamp(1, m::N_FRAMES);

        Ok(Self {
            model,
            tokenizer,
            config,
            mel_filters,
            device: device.clone(),
            dtype,
            suppress_tokens,
            suppress_tokens_timestamped,
            sot_token,
            transcribe_token,
            translate_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            language_tokens,
            frames_per_segment,
            seed: rand::rngs::StdRng::from_seed([0; 32]),
        })
    }

    pub fn transcribe(
        &mut self,
        samples: &[f32],
        language: &str,
        task: Task,
        timestamps: bool,
    ) -> Result<Vec<Segment>> {
        let mel = self.load_mel(samples)?;
        let (_, _, content_frames) = mel.dims3()?;
        let Ok(language_token) = token_id(&self.tokenizer, &format!("<|{language}|>")) else {
            bail!("language {language} is not supported")
        };
        let task_token = match task {
            Task::Transcribe => self.transcribe_token,
            Task::Translate => self.translate_token,
        };

        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, self.frames_per_segment);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let dr =
                self.decode_with_fallback(&mel_segment, language_token, task_token, timestamps)?;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!(seek, no_speech_prob = dr.no_speech_prob, "no speech detected, skipping");
                continue;
            }
            let chunks = if timestamps {
                self.timestamp_chunks(&dr.tokens, time_offset)?
            } else {
                Vec::new()
            };
            let text: String = if timestamps {
                chunks.iter().map(|c| c.text.as_str()).collect()
            } else {
                dr.text.clone()
            };
            debug!(
                "{:.1}s -- {:.1}s: {}",
                time_offset,
                time_offset + segment_duration,
                text,
            );
            segments.push(Segment {
                start: time_offset,
                duration: segment_duration,
                text,
                chunks,
            });
        }
        Ok(segments)
    }

    /// Single forward pass from the start-of-transcript token over at most
    /// the first 30 seconds; returns the top language hypothesis and its
    /// probability within the language-token subset.
    pub fn detect_language(&mut self, samples: &[f32], sample_rate: u32) -> Result<(String, f64)> {
        if self.language_tokens.is_empty() {
            return Ok(("unknown".to_string(), 1.0));
        }
        let window = detection_window(samples, sample_rate);
        let mel = self.load_mel(window)?;
        let audio_features = self.model.encoder.forward(&mel, true)?;
        let tokens_t = Tensor::new(&[self.sot_token], &self.device)?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens_t, &audio_features, true)?;
        let logits = self
            .model
            .decoder
            .final_linear(&ys.i(..1)?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;
        let ids: Vec<u32> = self.language_tokens.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let logits = logits.index_select(&ids, 0)?;
        let probs: Vec<f32> = softmax(&logits, D::Minus1)?.to_vec1()?;
        match probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
        {
            Some((index, prob)) => {
                Ok((self.language_tokens[index].0.to_string(), f64::from(*prob)))
            }
            None => Ok(("unknown".to_string(), 1.0)),
        }
    }

    fn decode_with_fallback(
        &mut self,
        segment: &Tensor,
        language_token: u32,
        task_token: u32,
        timestamps: bool,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> =
                self.decode(segment, t, language_token, task_token, timestamps);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    tracing::error!("Error running at {t}: {err}");
                }
            }
        }
        unreachable!()
    }

    fn decode(
        &mut self,
        mel: &Tensor,
        t: f64,
        language_token: u32,
        task_token: u32,
        timestamps: bool,
    ) -> Result<DecodingResult> {
        let suppress_tokens = if timestamps {
            &self.suppress_tokens_timestamped
        } else {
            &self.suppress_tokens
        };
        let model = &mut self.model;
        let audio_features = model.encoder.forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![self.sot_token, language_token, task_token];
        if !timestamps {
            tokens.push(self.no_timestamps_token);
        }
        for i in 0..MAX_NEW_TOKENS {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not
            // handle it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by
            // looking at the first token logits and the probability for the
            // according token.
            if i == 0 {
                let logits = model
                    .decoder
                    .final_linear(&ys.i(..1)?)?
                    .i(0)?
                    .i(0)?
                    .to_dtype(DType::F32)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let logits = logits.broadcast_add(suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.seed))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .unwrap_or(self.eot_token)
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > model.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("decode tokens: {e}"))?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            tokens,
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
            compression_ratio: f64::NAN,
        })
    }

    fn timestamp_chunks(&self, tokens: &[u32], time_offset: f64) -> Result<Vec<RawChunk>> {
        let spans = split_timestamp_spans(
            tokens,
            self.sot_token,
            self.eot_token,
            self.no_timestamps_token,
        );
        let mut chunks = Vec::with_capacity(spans.len());
        for span in spans {
            let text = self
                .tokenizer
                .decode(&span.tokens, true)
                .map_err(|e| anyhow!("decode tokens: {e}"))?;
            if text.trim().is_empty() {
                continue;
            }
            chunks.push(RawChunk {
                text,
                start: span.start.map(|t| t + time_offset),
                end: span.end.map(|t| t + time_offset),
            });
        }
        Ok(chunks)
    }

    fn load_mel(&self, samples: &[f32]) -> Result<Tensor> {
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

struct TimestampSpan {
    tokens: Vec<u32>,
    start: Option<f64>,
    end: Option<f64>,
}

/// Splits a decoded token stream at its timestamp tokens. Text emitted before
/// the first timestamp has no start; text after the last timestamp has no
/// end. Special tokens below the timestamp range stay in the span and are
/// dropped later by special-token-skipping decoding.
fn split_timestamp_spans(
    tokens: &[u32],
    sot_token: u32,
    eot_token: u32,
    no_timestamps_token: u32,
) -> Vec<TimestampSpan> {
    let mut spans = Vec::new();
    let mut pending: Vec<u32> = Vec::new();
    let mut prev_timestamp: Option<f64> = None;
    for &token in tokens {
        if token == sot_token || token == eot_token {
            continue;
        }
        // The no_timestamp_token is the last before the timestamp ones.
        if token > no_timestamps_token {
            let timestamp = f64::from(token - no_timestamps_token + 1) / 50.0;
            if !pending.is_empty() {
                spans.push(TimestampSpan {
                    tokens: std::mem::take(&mut pending),
                    start: prev_timestamp,
                    end: Some(timestamp),
                });
            }
            prev_timestamp = Some(timestamp);
        } else {
            pending.push(token);
        }
    }
    if !pending.is_empty() {
        spans.push(TimestampSpan {
            tokens: pending,
            start: prev_timestamp,
            end: None,
        });
    }
    spans
}

fn detection_window(samples: &[f32], sample_rate: u32) -> &[f32] {
    let max_samples = DETECT_WINDOW_S * sample_rate as usize;
    &samples[..samples.len().min(max_samples)]
}

fn suppress_mask(config: &Config, also_suppress: Option<u32>, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..config.vocab_size as u32)
        .map(|i| {
            if config.suppress_tokens.contains(&i) || also_suppress == Some(i) {
                f32::NEG_INFINITY
            } else {
                0f32
            }
        })
        .collect();
    Ok(Tensor::new(mask.as_slice(), device)?)
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}
