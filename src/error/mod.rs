use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::callback::SinkError;
use crate::service::EventServiceError;
use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Event service error: {0}")]
    EventService(#[from] EventServiceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Callback client error: {0}")]
    Callback(#[from] SinkError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn client_message(detail: &str, generic: &str) -> String {
    if is_production() {
        generic.to_string()
    } else {
        detail.to_string()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let log_message = self.to_string();
        let (status, code, client_message) = match &self {
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                client_message(&e.to_string(), "Configuration error"),
            ),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                client_message(e, "Internal server error"),
            ),
            // Unknown or misconfigured channels are the caller's problem
            AppError::EventService(EventServiceError::Configuration(msg)) => {
                (StatusCode::NOT_FOUND, "CHANNEL_NOT_AVAILABLE", msg.clone())
            }
            AppError::EventService(EventServiceError::Session(e)) | AppError::Session(e) => {
                match e {
                    SessionError::Closed { .. } => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "SESSION_CLOSED",
                        e.to_string(),
                    ),
                    SessionError::Transport { .. } => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "TRANSPORT_ERROR",
                        client_message(&e.to_string(), "Service temporarily unavailable"),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "SESSION_ERROR",
                        client_message(&e.to_string(), "Internal server error"),
                    ),
                }
            }
            AppError::Callback(e) => (
                StatusCode::BAD_GATEWAY,
                "CALLBACK_ERROR",
                client_message(&e.to_string(), "Callback API unavailable"),
            ),
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
