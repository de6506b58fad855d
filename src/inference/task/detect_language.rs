use serde::{Deserialize, Serialize};

use crate::audio::NormalizedAudio;
use crate::error::{ServiceError, ServiceResult};
use crate::inference::engine::EngineHandle;
use crate::inference::round_to;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DetectLanguageResponse {
    pub language: String,
    pub language_probability: f64,
    pub model: String,
}

/// Runs language identification behind the same admission gate as
/// transcription; the two paths compete for the same inference slots.
#[tracing::instrument(level = "info", skip(engine, audio), fields(samples = audio.samples.len()))]
pub async fn run(
    engine: &EngineHandle,
    audio: NormalizedAudio,
) -> ServiceResult<DetectLanguageResponse> {
    let mut pipeline = engine.pipeline();
    let samples = audio.samples;
    let sample_rate = audio.sample_rate;
    let (language, probability) = engine
        .gate()
        .run_blocking(move || pipeline.detect_language(&samples, sample_rate))
        .await
        .map_err(ServiceError::Inference)?;

    Ok(DetectLanguageResponse {
        language,
        language_probability: round_to(probability, 4),
        model: engine.model_id().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_probability_when_shaped_then_four_decimals() {
        let response = DetectLanguageResponse {
            language: "da".to_string(),
            language_probability: round_to(0.912_345_6, 4),
            model: "syvai/hviske-v3-conversation".to_string(),
        };
        assert_eq!(response.language_probability, 0.9123);
    }

    #[test]
    fn given_response_when_serialized_then_wire_fields_match() {
        let response = DetectLanguageResponse {
            language: "da".to_string(),
            language_probability: 0.9123,
            model: "m".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["language"], "da");
        assert_eq!(json["language_probability"], 0.9123);
        assert_eq!(json["model"], "m");
    }
}
