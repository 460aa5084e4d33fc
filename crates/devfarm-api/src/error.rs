//! API error types and conversions

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use devfarm_core::FarmError;
use serde::Serialize;

/// API error type that converts to HTTP responses
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request
    BadRequest(String),
    /// 404 Not Found
    NotFound(String),
    /// 501 Not Implemented
    NotImplemented(String),
    /// 502 Bad Gateway (device cloud error)
    BadGateway(String),
    /// 503 Service Unavailable (no device could be acquired)
    ServiceUnavailable(String),
    /// 504 Gateway Timeout
    GatewayTimeout(String),
    /// 500 Internal Server Error
    Internal(String),
}

/// Standard error response format
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, "not_implemented", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            ApiError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "gateway_timeout", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        if status.is_server_error() {
            tracing::error!(error = error_type, %message, "API error");
        } else if status.is_client_error() {
            tracing::debug!(error = error_type, %message, "API client error");
        }

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<FarmError> for ApiError {
    fn from(err: FarmError) -> Self {
        let message = err.to_string();
        match err {
            FarmError::InvalidRequest(_) | FarmError::Signature(_) => ApiError::BadRequest(message),
            FarmError::NotFound(_) => ApiError::NotFound(message),
            FarmError::NotSupported(_) => ApiError::NotImplemented(message),
            FarmError::NoCandidateDevice(_) | FarmError::NoSessionAvailable { .. } => {
                ApiError::ServiceUnavailable(message)
            }
            FarmError::FlashTimeout { .. } => ApiError::GatewayTimeout(message),
            FarmError::FlashJobFailed { .. }
            | FarmError::ProxyCreationFailed { .. }
            | FarmError::Remote(_)
            | FarmError::Unauthorized(_) => ApiError::BadGateway(message),
            FarmError::InvalidConfig(_) | FarmError::Internal(_) => ApiError::Internal(message),
        }
    }
}
