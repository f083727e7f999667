//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gantry_engine::{ExecutorError, RegistryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient capacity")]
    CapacityExhausted,

    #[error("Draining: refusing new work")]
    Draining,

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::CapacityExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, "insufficient_capacity")
            }
            ApiError::Draining => (StatusCode::SERVICE_UNAVAILABLE, "draining"),
            ApiError::BackendUnreachable(_) => (StatusCode::BAD_GATEWAY, "backend_unreachable"),
            ApiError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, "backend_error"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Registry(RegistryError::AlreadyExists { guid }) => {
                ApiError::Conflict(format!("container '{guid}' already exists"))
            }
            ExecutorError::Registry(RegistryError::InsufficientCapacity) => {
                ApiError::CapacityExhausted
            }
            ExecutorError::Registry(RegistryError::NotFound { guid }) => {
                ApiError::NotFound(format!("container '{guid}' not found"))
            }
            ExecutorError::Registry(err @ RegistryError::WrongState { .. }) => {
                ApiError::Conflict(err.to_string())
            }
            err @ ExecutorError::LimitsInvalid(_) => ApiError::BadRequest(err.to_string()),
            err @ ExecutorError::StepsInvalid(_) => ApiError::BadRequest(err.to_string()),
            err @ ExecutorError::NotInitialized { .. } => ApiError::Conflict(err.to_string()),
            err @ ExecutorError::AlreadyBound { .. } => ApiError::Conflict(err.to_string()),
            ExecutorError::Backend(backend_err) => match backend_err {
                gantry_engine::BackendError::Unreachable(reason) => {
                    ApiError::BackendUnreachable(reason)
                }
                other => ApiError::Backend(other.to_string()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
