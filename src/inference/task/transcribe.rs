use serde::{Deserialize, Serialize};

use crate::audio::NormalizedAudio;
use crate::error::{ServiceError, ServiceResult};
use crate::inference::audio_pipeline::{Segment, Task};
use crate::inference::engine::EngineHandle;
use crate::inference::round_to;

/// Per-request generation options; defaults mirror the form defaults of the
/// transcription endpoint.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub language: String,
    pub task: Task,
    pub timestamps: bool,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: "da".to_string(),
            task: Task::Transcribe,
            timestamps: true,
        }
    }
}

/// Timestamped text fragment. Wire shape is
/// `{"text": ..., "timestamp": [start, end-or-null]}`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub timestamp: (f64, Option<f64>),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TranscribeResponse {
    pub text: String,
    pub chunks: Option<Vec<Chunk>>,
    pub language: String,
    pub duration_s: f64,
    pub model: String,
    pub device: String,
}

/// Runs transcription behind the engine's admission gate and assembles the
/// response. Duration is taken from the normalized buffer before inference so
/// it is known regardless of the decode outcome. One shot, no retries, no
/// partial results.
#[tracing::instrument(level = "info", skip(engine, audio), fields(samples = audio.samples.len()))]
pub async fn run(
    engine: &EngineHandle,
    audio: NormalizedAudio,
    options: TranscribeOptions,
) -> ServiceResult<TranscribeResponse> {
    let duration_s = audio.duration_s();

    let mut pipeline = engine.pipeline();
    let language = options.language.clone();
    let task = options.task;
    let timestamps = options.timestamps;
    let samples = audio.samples;
    let segments = engine
        .gate()
        .run_blocking(move || pipeline.transcribe(&samples, &language, task, timestamps))
        .await
        .map_err(ServiceError::Inference)?;

    let (text, chunks) = assemble(segments, options.timestamps);
    Ok(TranscribeResponse {
        text,
        chunks,
        language: options.language,
        duration_s: round_to(duration_s, 2),
        model: engine.model_id().to_string(),
        device: engine.device_name(),
    })
}

/// Joins segment texts and maps engine chunks to wire chunks. An absent chunk
/// start becomes 0.0; an absent end stays absent. Without timestamps the
/// response carries no chunk sequence at all.
fn assemble(segments: Vec<Segment>, timestamps: bool) -> (String, Option<Vec<Chunk>>) {
    let text: String = segments.iter().map(|s| s.text.as_str()).collect();
    if !timestamps {
        return (text, None);
    }
    let chunks = segments
        .into_iter()
        .flat_map(|segment| segment.chunks)
        .map(|chunk| Chunk {
            text: chunk.text,
            timestamp: (chunk.start.unwrap_or(0.0), chunk.end),
        })
        .collect();
    (text, Some(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::audio_pipeline::RawChunk;

    fn segment(text: &str, chunks: Vec<RawChunk>) -> Segment {
        Segment {
            start: 0.0,
            duration: 30.0,
            text: text.to_string(),
            chunks,
        }
    }

    #[test]
    fn given_chunk_without_start_when_assembled_then_start_becomes_zero() {
        let segments = vec![segment(
            " hello",
            vec![RawChunk {
                text: " hello".to_string(),
                start: None,
                end: Some(1.2),
            }],
        )];

        let (_, chunks) = assemble(segments, true);

        assert_eq!(
            chunks.unwrap(),
            vec![Chunk {
                text: " hello".to_string(),
                timestamp: (0.0, Some(1.2)),
            }]
        );
    }

    #[test]
    fn given_chunk_without_end_when_assembled_then_end_stays_absent() {
        let segments = vec![segment(
            " trailing",
            vec![RawChunk {
                text: " trailing".to_string(),
                start: Some(2.0),
                end: None,
            }],
        )];

        let (_, chunks) = assemble(segments, true);

        assert_eq!(chunks.unwrap()[0].timestamp, (2.0, None));
    }

    #[test]
    fn given_timestamps_not_requested_when_assembled_then_no_chunk_sequence() {
        let segments = vec![segment(" a", vec![]), segment(" b", vec![])];

        let (text, chunks) = assemble(segments, false);

        assert_eq!(text, " a b");
        assert!(chunks.is_none());
    }

    #[test]
    fn given_timestamps_requested_but_no_engine_chunks_then_empty_sequence() {
        let segments = vec![segment(" silence", vec![])];

        let (_, chunks) = assemble(segments, true);

        assert_eq!(chunks, Some(vec![]));
    }

    #[test]
    fn given_multiple_segments_when_assembled_then_chunks_keep_order() {
        let segments = vec![
            segment(
                " one",
                vec![RawChunk {
                    text: " one".to_string(),
                    start: Some(0.0),
                    end: Some(2.0),
                }],
            ),
            segment(
                " two",
                vec![RawChunk {
                    text: " two".to_string(),
                    start: Some(30.0),
                    end: None,
                }],
            ),
        ];

        let (text, chunks) = assemble(segments, true);
        let chunks = chunks.unwrap();

        assert_eq!(text, " one two");
        assert_eq!(chunks[0].text, " one");
        assert_eq!(chunks[1].timestamp, (30.0, None));
    }

    #[test]
    fn given_default_options_then_danish_transcription_with_timestamps() {
        let options = TranscribeOptions::default();
        assert_eq!(options.language, "da");
        assert_eq!(options.task, Task::Transcribe);
        assert!(options.timestamps);
    }

    #[test]
    fn given_chunk_when_serialized_then_timestamp_is_a_pair() {
        let chunk = Chunk {
            text: "hej".to_string(),
            timestamp: (0.0, None),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["timestamp"], serde_json::json!([0.0, null]));
    }
}
