use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use leadfunnel_core::EngineError;

/// Application-level errors that map directly to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Query-string field at fault, when there is exactly one.
    fn field(&self) -> Option<&'static str> {
        match self {
            AppError::Engine(EngineError::InvalidWindow { .. }) => Some("start_date"),
            AppError::Engine(EngineError::InvalidTimezone(_)) => Some("timezone"),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let field = self.field();
        let (status, code, message) = match &self {
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            AppError::Engine(e) if e.is_client_error() => {
                (StatusCode::BAD_REQUEST, "validation_error", e.to_string())
            }
            AppError::Engine(EngineError::Fetch(e)) => {
                tracing::error!("Event store fetch failed: {e:#}");
                (
                    StatusCode::BAD_GATEWAY,
                    "event_store_unavailable",
                    "Event store unavailable".to_string(),
                )
            }
            AppError::Engine(EngineError::FetchTimeout(after)) => {
                tracing::warn!(?after, "Event store fetch timed out");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    "event_store_timeout",
                    "Event store did not respond in time".to_string(),
                )
            }
            AppError::Engine(e) => {
                tracing::error!("Engine error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                    "field": field
                }
            })),
        )
            .into_response()
    }
}
