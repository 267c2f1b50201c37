use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => AppError::Cancelled,
            ProviderError::Parse(msg) => AppError::Parse(msg),
            ProviderError::Unavailable { .. }
            | ProviderError::Transport(_)
            | ProviderError::Timeout => AppError::ProviderUnavailable(err.to_string()),
            ProviderError::Provider { .. } => AppError::Provider(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::SessionNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Provider(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::ProviderUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Parse(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::InvariantViolation(msg) => {
                tracing::error!("Invariant violation: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
