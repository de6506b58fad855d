use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Failure taxonomy for the request pipeline. Every failure is rendered as a
/// single JSON body with a machine-readable category and a message; the core
/// never retries and never returns a partially filled success result.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("model not loaded yet")]
    EngineNotReady,

    #[error("file too large (max {limit_mb}MB)")]
    PayloadTooLarge { limit_mb: usize },

    /// The external decode step failed; carries the decoder's diagnostic text.
    #[error("audio decode failed: {0}")]
    Decode(String),

    /// The engine raised during transcription or detection. The full error
    /// chain is logged server-side; the caller gets the summary line.
    #[error("inference failed: {0}")]
    Inference(anyhow::Error),

    #[error("{0}")]
    BadRequest(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::EngineNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ServiceError::EngineNotReady => "engine_not_ready",
            ServiceError::PayloadTooLarge { .. } => "payload_too_large",
            ServiceError::Decode(_) => "decode_error",
            ServiceError::Inference(_) => "inference_error",
            ServiceError::BadRequest(_) => "bad_request",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
    category: &'static str,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let ServiceError::Inference(ref err) = self {
            tracing::error!(error = ?err, "inference error");
        }
        let body = HttpErrorResponse {
            error: self.to_string(),
            category: self.category(),
        };
        let mut res = Json(body).into_response();
        *res.status_mut() = self.status();
        res
    }
}

pub type ServiceResult<T, E = ServiceError> = Result<T, E>;
