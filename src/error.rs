//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: failures of the HTTP surface (config endpoints, persona
//!   lookups). These render as JSON bodies with a matching status code.
//! - [`VoiceError`]: failures inside a live voice session. These never tear
//!   down the connection; the connection loop turns them into an `error`
//!   envelope and keeps reading.
//!
//! Engine adapters report [`EngineError`](crate::engines::EngineError), which
//! converts into `VoiceError::Engine` with `?`.
//!
//! ## JSON Response Format
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "Character not found: gandalf",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::engines::{EngineError, TranscriberState};
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// ## Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `anyhow` errors surface as 500s. Config validation uses anyhow, so the
/// config handler maps those to `ValidationError` explicitly instead.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed request bodies are the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors raised while handling a voice session frame.
///
/// The `Display` text of each variant is exactly what the client receives in
/// the `error` field of the outbound envelope, so keep the wording stable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoiceError {
    /// Undecodable payload, unknown message type or an invalid field.
    #[error("malformed message: {0}")]
    Protocol(String),

    /// Text frame rejected before any parsing was attempted.
    #[error("message too large: {len} characters exceeds the {limit} character limit")]
    MessageTooLarge { len: usize, limit: usize },

    /// The connection has no live session bound to it.
    #[error("session not active")]
    SessionNotActive,

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("session limit reached ({0} concurrent sessions)")]
    SessionLimit(usize),

    /// Audio arrived while the transcription engine cannot take it.
    #[error("session not active: transcriber is {0}, send start_transcriber to resume")]
    EngineState(TranscriberState),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type VoiceResult<T> = Result<T, VoiceError>;
