use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by the HTTP API.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Auth(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let detail = match &self {
            AppError::Auth(msg) | AppError::Validation(msg) | AppError::Internal(msg) => msg.clone(),
        };

        let message = match self {
            AppError::Internal(_) if is_production() => "Internal server error".to_string(),
            _ => detail.clone(),
        };

        if status.is_server_error() {
            tracing::error!(code, status = status.as_u16(), message = %detail, "API error");
        } else {
            tracing::debug!(code, status = status.as_u16(), message = %detail, "API request rejected");
        }

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
