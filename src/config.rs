use anyhow::Result;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

#[derive(ClapSerde, Deserialize, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub(crate) address: String,

    /// The port the listener binds to
    #[arg(short, long, env, default_value = "8000")]
    pub(crate) port: u16,

    /// Hub identifier of the speech model to serve
    #[arg(short, long, env, default_value = "syvai/hviske-v3-conversation")]
    pub(crate) model_id: String,

    /// Revision of the model repository
    #[arg(long, env, default_value = "main")]
    pub(crate) model_revision: String,

    /// Access token for gated model repositories
    #[arg(long, env)]
    pub(crate) hf_token: Option<String>,

    /// Number of requests allowed to run inference at the same time
    #[arg(long, env, default_value = "1")]
    pub(crate) inference_slots: usize,

    /// Upload size ceiling in megabytes
    #[arg(long, env, default_value = "500")]
    pub(crate) max_file_size_mb: usize,

    /// Window length in seconds used to split long audio during decoding
    #[arg(long, env, default_value = "30")]
    pub(crate) chunk_length_s: usize,

    /// OTLP endpoint to export traces and metrics to
    #[arg(long, env)]
    pub(crate) otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }
}
