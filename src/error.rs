//! Error handling for camwatch

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Capture device could not be opened (fatal to the worker process)
    #[error("Video source unavailable: {0}")]
    SourceUnavailable(String),

    /// Live source stopped producing frames (fatal to the worker process)
    #[error("Video source exhausted: {0}")]
    SourceExhausted(String),

    /// Control-plane channel error (transient, retried by callers)
    #[error("Channel error: {0}")]
    Channel(#[from] redis::RedisError),

    /// Detector collaborator failure
    #[error("Detector error: {0}")]
    Detector(String),

    /// Frame encode failure
    #[error("Encode error: {0}")]
    Encode(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Supervisor error
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::SourceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SOURCE_UNAVAILABLE",
                msg.clone(),
            ),
            Error::SourceExhausted(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SOURCE_EXHAUSTED",
                msg.clone(),
            ),
            Error::Channel(e) => (StatusCode::BAD_GATEWAY, "CHANNEL_ERROR", e.to_string()),
            Error::Detector(msg) => (StatusCode::BAD_GATEWAY, "DETECTOR_ERROR", msg.clone()),
            Error::Encode(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENCODE_ERROR",
                msg.clone(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::Supervisor(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SUPERVISOR_ERROR",
                msg.clone(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
