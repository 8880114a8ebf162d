//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps the
//! failure modes of the routing engine and implements proper HTTP response
//! conversion. Upstream client-fault responses (4xx other than 429) never
//! become an [`AppError`]; they are forwarded to the caller verbatim.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// A single failed upstream attempt, reported in the 502 aggregate body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderFailure {
    /// Provider name from the configuration.
    pub provider: String,
    /// Short failure summary ("HTTP 503", "timeout", "connect error: ...").
    pub reason: String,
}

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// The caller's admission credential is missing or wrong.
    #[error("invalid api key")]
    Unauthorized,

    /// The request cannot be routed (missing model, malformed body).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No enabled, non-cooling provider supports the requested model.
    #[error("no provider available for model")]
    NoProviderAvailable,

    /// Every eligible candidate was attempted and failed.
    #[error("all providers failed")]
    AllProvidersFailed(Vec<ProviderFailure>),

    /// Configuration errors (load, parse, validation).
    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Generic internal server errors. The message is logged, never leaked.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "invalid api key"})),
            )
                .into_response(),
            AppError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({"detail": message}))).into_response()
            }
            AppError::NoProviderAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"detail": "no provider available for model"})),
            )
                .into_response(),
            AppError::AllProvidersFailed(errors) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"detail": "all providers failed", "errors": errors})),
            )
                .into_response(),
            AppError::Config(error) => {
                tracing::error!(error = %error, "Configuration error surfaced to a request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": "internal server error"})),
                )
                    .into_response()
            }
            AppError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": "internal server error"})),
                )
                    .into_response()
            }
        }
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
