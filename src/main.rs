use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::inference::audio_pipeline::Task;
use crate::inference::engine::EngineHandle;
use crate::inference::task;
use crate::inference::task::detect_language::DetectLanguageResponse;
use crate::inference::task::transcribe::{TranscribeOptions, TranscribeResponse};

mod audio;
mod config;
mod error;
mod inference;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "HviskeServer.toml";

const BYTES_PER_MB: usize = 1024 * 1024;

/// Slack on top of the file ceiling for multipart framing and the small text
/// fields that share the body with the upload.
const MULTIPART_SLACK_BYTES: usize = 64 * 1024;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
struct AppState {
    /// Written exactly once when the loader task finishes; read concurrently
    /// by every request afterwards.
    engine: Arc<OnceCell<EngineHandle>>,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                eprintln!(
                    "Failed to read configuration file {} with error: {err}",
                    args.config_file
                );
                std::process::exit(1);
            }
        }
    };
    telemetry::init_telemetry(config.otlp_endpoint.as_deref());
    audio::check_ffmpeg_binary();

    let state = AppState {
        engine: Arc::new(OnceCell::new()),
        config: Arc::new(config),
    };

    // Weight retrieval can take minutes on a cold cache; the listener comes up
    // immediately and answers 503 until the engine is in place. A load failure
    // is fatal.
    let engine_cell = Arc::clone(&state.engine);
    let load_config = Arc::clone(&state.config);
    tokio::spawn(async move {
        let loaded = tokio::task::spawn_blocking(move || EngineHandle::load(&load_config)).await;
        match loaded {
            Ok(Ok(engine)) => {
                if engine_cell.set(engine).is_err() {
                    error!("engine initialized twice");
                }
            }
            Ok(Err(err)) => {
                error!("Failed to load model: {err:#}");
                std::process::exit(1);
            }
            Err(err) => {
                error!("Model loading task failed: {err}");
                std::process::exit(1);
            }
        }
    });

    let address = state.config.address.clone();
    let port = state.config.port;
    let router = build_router(state);

    let listener = TcpListener::bind(format!("{address}:{port}")).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let body_limit = max_upload_bytes(state.config.max_file_size_mb) + MULTIPART_SLACK_BYTES;
    Router::new()
        .route("/health", get(handle_health))
        .route("/transcribe", post(handle_transcribe))
        .route("/detect-language", post(handle_detect_language))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: String,
    vram_used_gb: Option<f64>,
    vram_total_gb: Option<f64>,
}

#[axum_macros::debug_handler]
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.engine.get();
    let (vram_used_gb, vram_total_gb) = engine.map_or((None, None), EngineHandle::vram_info);
    Json(HealthResponse {
        status: "ok",
        model_loaded: engine.is_some(),
        device: engine.map_or_else(|| "cpu".to_string(), EngineHandle::device_name),
        vram_used_gb,
        vram_total_gb,
    })
}

#[axum_macros::debug_handler]
async fn handle_transcribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ServiceResult<Json<TranscribeResponse>> {
    let engine = state.engine.get().ok_or(ServiceError::EngineNotReady)?;
    reject_oversized_header(&headers, state.config.max_file_size_mb)?;

    let form = read_transcribe_form(&mut multipart).await?;
    ensure_within_limit(form.file.len(), state.config.max_file_size_mb)?;

    let audio = audio::normalize(form.file, &form.filename).await?;
    let duration_s = audio.duration_s();
    let started = Instant::now();

    let response = task::transcribe::run(engine, audio, form.options).await?;

    info!(
        "Transcribed {duration_s:.1}s audio in {:.1}s",
        started.elapsed().as_secs_f64()
    );
    Ok(Json(response))
}

#[axum_macros::debug_handler]
async fn handle_detect_language(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ServiceResult<Json<DetectLanguageResponse>> {
    let engine = state.engine.get().ok_or(ServiceError::EngineNotReady)?;
    reject_oversized_header(&headers, state.config.max_file_size_mb)?;

    let (file, filename) = read_detect_form(&mut multipart).await?;
    ensure_within_limit(file.len(), state.config.max_file_size_mb)?;

    let audio = audio::normalize(file, &filename).await?;
    let response = task::detect_language::run(engine, audio).await?;
    Ok(Json(response))
}

struct TranscribeForm {
    file: Vec<u8>,
    filename: String,
    options: TranscribeOptions,
}

async fn read_transcribe_form(multipart: &mut Multipart) -> ServiceResult<TranscribeForm> {
    let mut file: Option<(Vec<u8>, String)> = None;
    let mut options = TranscribeOptions::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("audio").to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                file = Some((bytes.to_vec(), filename));
            }
            "language" => options.language = field.text().await.map_err(bad_multipart)?,
            "task" => {
                let value = field.text().await.map_err(bad_multipart)?;
                options.task = Task::from_form(&value)
                    .ok_or_else(|| ServiceError::BadRequest(format!("unknown task {value}")))?;
            }
            "return_timestamps" => {
                let value = field.text().await.map_err(bad_multipart)?;
                options.timestamps = parse_form_bool(&value).ok_or_else(|| {
                    ServiceError::BadRequest(format!("invalid return_timestamps value {value}"))
                })?;
            }
            other => {
                return Err(ServiceError::BadRequest(format!(
                    "unknown field {other} in multipart form"
                )))
            }
        }
    }

    let (file, filename) =
        file.ok_or_else(|| ServiceError::BadRequest("missing field file".to_string()))?;
    Ok(TranscribeForm {
        file,
        filename,
        options,
    })
}

async fn read_detect_form(multipart: &mut Multipart) -> ServiceResult<(Vec<u8>, String)> {
    let mut file: Option<(Vec<u8>, String)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name != "file" {
            return Err(ServiceError::BadRequest(format!(
                "unknown field {name} in multipart form"
            )));
        }
        let filename = field.file_name().unwrap_or("audio").to_string();
        let bytes = field.bytes().await.map_err(bad_multipart)?;
        file = Some((bytes.to_vec(), filename));
    }

    file.ok_or_else(|| ServiceError::BadRequest("missing field file".to_string()))
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> ServiceError {
    ServiceError::BadRequest(format!("failed to read multipart form: {err}"))
}

fn parse_form_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn max_upload_bytes(max_file_size_mb: usize) -> usize {
    max_file_size_mb * BYTES_PER_MB
}

/// Rejects on the declared request size before the body is read at all;
/// chunked uploads without a length are caught by the post-read check.
fn reject_oversized_header(headers: &HeaderMap, max_file_size_mb: usize) -> ServiceResult<()> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    match declared {
        Some(length) if length > max_upload_bytes(max_file_size_mb) + MULTIPART_SLACK_BYTES => {
            Err(ServiceError::PayloadTooLarge {
                limit_mb: max_file_size_mb,
            })
        }
        _ => Ok(()),
    }
}

fn ensure_within_limit(file_len: usize, max_file_size_mb: usize) -> ServiceResult<()> {
    if file_len > max_upload_bytes(max_file_size_mb) {
        return Err(ServiceError::PayloadTooLarge {
            limit_mb: max_file_size_mb,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn test_state(max_file_size_mb: usize) -> AppState {
        let args = Args::try_parse_from(["hviske-server"]).unwrap();
        let mut config = Config::default().merge(args.opt_config);
        config.max_file_size_mb = max_file_size_mb;
        AppState {
            engine: Arc::new(OnceCell::new()),
            config: Arc::new(config),
        }
    }

    fn multipart_upload(uri: &str, file_bytes: &[u8]) -> Request<Body> {
        let boundary = "test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"audio.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file_bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn given_no_flags_when_config_merged_then_documented_defaults_apply() {
        let args = Args::try_parse_from(["hviske-server"]).unwrap();
        let config = Config::default().merge(args.opt_config);

        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.model_id, "syvai/hviske-v3-conversation");
        assert_eq!(config.model_revision, "main");
        assert_eq!(config.hf_token, None);
        assert_eq!(config.inference_slots, 1);
        assert_eq!(config.max_file_size_mb, 500);
        assert_eq!(config.chunk_length_s, 30);
    }

    #[tokio::test]
    async fn given_unloaded_engine_when_health_checked_then_reports_not_loaded() {
        let app = build_router(test_state(500));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["model_loaded"], false);
        assert_eq!(json["device"], "cpu");
        assert_eq!(json["vram_used_gb"], serde_json::Value::Null);
        assert_eq!(json["vram_total_gb"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn given_unloaded_engine_when_transcribing_then_service_unavailable() {
        let app = build_router(test_state(500));

        let response = app
            .oneshot(multipart_upload("/transcribe", b"riff-ish bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["category"], "engine_not_ready");
    }

    #[tokio::test]
    async fn given_unloaded_engine_when_detecting_language_then_service_unavailable() {
        let app = build_router(test_state(500));

        let response = app
            .oneshot(multipart_upload("/detect-language", b"riff-ish bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn given_declared_length_above_ceiling_when_prechecked_then_payload_too_large() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "2097153".parse().unwrap());
        // 1 MB ceiling + 64 KiB slack < declared 2 MiB + 1
        let result = reject_oversized_header(&headers, 1);
        assert!(matches!(
            result,
            Err(ServiceError::PayloadTooLarge { limit_mb: 1 })
        ));
    }

    #[test]
    fn given_declared_length_within_ceiling_when_prechecked_then_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "1000".parse().unwrap());
        assert!(reject_oversized_header(&headers, 1).is_ok());
    }

    #[test]
    fn given_no_content_length_when_prechecked_then_accepted() {
        let headers = HeaderMap::new();
        assert!(reject_oversized_header(&headers, 1).is_ok());
    }

    #[test]
    fn given_file_above_ceiling_when_checked_then_payload_too_large() {
        assert!(ensure_within_limit(BYTES_PER_MB + 1, 1).is_err());
        assert!(ensure_within_limit(BYTES_PER_MB, 1).is_ok());
    }

    #[test]
    fn given_form_bool_values_when_parsed_then_only_known_spellings_accepted() {
        assert_eq!(parse_form_bool("true"), Some(true));
        assert_eq!(parse_form_bool("1"), Some(true));
        assert_eq!(parse_form_bool("false"), Some(false));
        assert_eq!(parse_form_bool("0"), Some(false));
        assert_eq!(parse_form_bool("yes"), None);
    }
}
