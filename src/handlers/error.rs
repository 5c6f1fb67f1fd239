//! HTTP error mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::error::JvsError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Caller mistake; every violation is returned.
    #[error("Invalid request: {}", .0.join("; "))]
    InvalidArgument(Vec<String>),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected to keep a key lifecycle invariant intact.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Service unavailable")]
    Unavailable,

    #[error("Internal error")]
    Internal,
}

/// API error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            ApiError::InvalidArgument(violations) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                "Invalid request".to_string(),
                Some(serde_json::json!({ "violations": violations })),
            ),
            ApiError::Unauthenticated(msg) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                msg.clone(),
                None,
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            ApiError::FailedPrecondition(msg) => (
                StatusCode::CONFLICT,
                "FAILED_PRECONDITION",
                msg.clone(),
                None,
            ),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "Service temporarily unavailable, retry later".to_string(),
                None,
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal error".to_string(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<JvsError> for ApiError {
    fn from(err: JvsError) -> Self {
        match err {
            JvsError::Validation(v) => ApiError::InvalidArgument(v.violations().to_vec()),
            JvsError::SignatureInvalid | JvsError::InvalidToken(_) => {
                ApiError::Unauthenticated(err.to_string())
            }
            JvsError::VersionNotFound(_) => ApiError::NotFound(err.to_string()),
            JvsError::WouldOrphanKey { .. }
            | JvsError::InvalidStateTransition { .. }
            | JvsError::ConcurrentModification { .. } => {
                ApiError::FailedPrecondition(err.to_string())
            }
            JvsError::RemoteService(_) => {
                error!("Remote service failure: {}", err);
                ApiError::Unavailable
            }
            JvsError::Signing(_)
            | JvsError::NoPrimaryKey { .. }
            | JvsError::KeyUnavailable { .. }
            | JvsError::Internal(_) => {
                error!("Internal failure: {}", err);
                ApiError::Internal
            }
        }
    }
}
