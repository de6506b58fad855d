use anyhow::{Context, Result};
use candle_core::utils::cuda_is_available;
use candle_core::{DType, Device};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use tracing::info;

use crate::config::Config;
use crate::inference::audio_pipeline::AudioGeneratorPipeline;
use crate::inference::gate::InferenceGate;

/// Hub repository that ships the precomputed mel filterbanks, used when the
/// model repository does not carry them itself.
const MEL_FILTERS_REPO: &str = "FL33TW00D-HF/whisper-base";

#[cfg(any(test, feature = "cuda"))]
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The loaded model with its preprocessing artifacts, resolved device and
/// admission gate. Built exactly once at startup and read-only afterwards;
/// requests clone the pipeline (tensor storage is shared) and run it behind
/// the gate.
pub struct EngineHandle {
    pipeline: AudioGeneratorPipeline,
    gate: InferenceGate,
    device: Device,
    model_id: String,
}

impl EngineHandle {
    /// Resolves the device, fetches the model artifacts and builds the decode
    /// pipeline. Any failure here is fatal to startup; there are no retries.
    #[tracing::instrument(level = "info", skip(config), fields(model = %config.model_id))]
    pub fn load(config: &Config) -> Result<Self> {
        let device = resolve_device()?;
        let dtype = if matches!(device, Device::Cuda(_)) {
            DType::F16
        } else {
            DType::F32
        };
        info!(device = %device_label(&device), dtype = ?dtype, "loading model");

        let api = ApiBuilder::new()
            .with_token(config.hf_token.clone())
            .build()?;
        let repo = api.repo(Repo::with_revision(
            config.model_id.clone(),
            RepoType::Model,
            config.model_revision.clone(),
        ));

        let config_path = repo.get("config.json").context("fetch config.json")?;
        let tokenizer_path = repo.get("tokenizer.json").context("fetch tokenizer.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .context("fetch model.safetensors")?;

        let model_config: candle_transformers::models::whisper::Config =
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let mel_filename = match model_config.num_mel_bins {
            128 => "melfilters128.bytes",
            _ => "melfilters.bytes",
        };
        let mel_path = repo.get(mel_filename).or_else(|_| {
            api.repo(Repo::new(MEL_FILTERS_REPO.to_string(), RepoType::Model))
                .get(mel_filename)
        })?;
        let mel_filter_bytes = std::fs::read(&mel_path).context("read mel filterbank")?;

        let pipeline = AudioGeneratorPipeline::from_safetensors(
            &config_path,
            &tokenizer_path,
            &weights_path,
            &mel_filter_bytes,
            &device,
            dtype,
            config.chunk_length_s,
        )?;

        info!(slots = config.inference_slots, "model loaded");
        Ok(Self {
            pipeline,
            gate: InferenceGate::new(config.inference_slots),
            device,
            model_id: config.model_id.clone(),
        })
    }

    /// A per-request copy of the pipeline; tensor storage is shared, decoder
    /// state is not, so requests never mutate engine state.
    pub fn pipeline(&self) -> AudioGeneratorPipeline {
        self.pipeline.clone()
    }

    pub fn gate(&self) -> &InferenceGate {
        &self.gate
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device_name(&self) -> String {
        device_label(&self.device)
    }

    /// Used and total accelerator memory in GB, `(None, None)` without an
    /// accelerator.
    #[cfg(feature = "cuda")]
    pub fn vram_info(&self) -> (Option<f64>, Option<f64>) {
        if !matches!(self.device, Device::Cuda(_)) {
            return (None, None);
        }
        match cudarc::driver::result::mem_get_info() {
            Ok((free, total)) => (
                Some(crate::inference::round_to(
                    (total - free) as f64 / BYTES_PER_GB,
                    2,
                )),
                Some(crate::inference::round_to(total as f64 / BYTES_PER_GB, 2)),
            ),
            Err(_) => (None, None),
        }
    }

    /// Used and total accelerator memory in GB, `(None, None)` without an
    /// accelerator.
    #[cfg(not(feature = "cuda"))]
    pub fn vram_info(&self) -> (Option<f64>, Option<f64>) {
        (None, None)
    }
}

fn resolve_device() -> Result<Device> {
    if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn device_label(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(_) => "cuda:0".to_string(),
        Device::Metal(_) => "metal:0".to_string(),
    }
}
