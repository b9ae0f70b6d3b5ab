//! API errors with stable machine-readable codes.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Session not found")]
    NotFound,

    #[error("Session has ended: {0}")]
    SessionGone(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session already active: {0}")]
    AlreadyActive(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Runtime failed: {0}")]
    RuntimeFailed(String),

    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::SessionGone(_) => StatusCode::GONE,
            Self::InvalidState(_) | Self::AlreadyActive(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RuntimeFailed(_) => StatusCode::BAD_GATEWAY,
            Self::ExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::SessionGone(_) => "SESSION_GONE",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::AlreadyActive(_) => "ALREADY_ACTIVE",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            Self::RuntimeFailed(_) => "RUNTIME_FAILED",
            Self::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::RuntimeFailed(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::RuntimeUnavailable(msg) | ApiError::ExecutionTimeout(msg) => {
                warn!(error_code = code, message = %msg, "Runtime error");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };

        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::QuotaExceeded(reason) => ApiError::QuotaExceeded(reason.to_string()),
            SessionError::NotFound => ApiError::NotFound,
            SessionError::Gone(id) => ApiError::SessionGone(id),
            SessionError::InvalidState(msg) => ApiError::InvalidState(msg),
            SessionError::AlreadyActive(id) => ApiError::AlreadyActive(id),
            SessionError::BadRequest(msg) => ApiError::BadRequest(msg),
            SessionError::RuntimeTransient(msg) => ApiError::RuntimeUnavailable(msg),
            SessionError::RuntimeFailed(msg) => ApiError::RuntimeFailed(msg),
            SessionError::ExecutionTimeout(after) => {
                ApiError::ExecutionTimeout(format!("no result after {:?}", after))
            }
            SessionError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

/// Malformed JSON bodies get the same error shape as everything else.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
