//! Error types for Testdroid client operations

use devfarm_core::FarmError;
use thiserror::Error;

/// Result type alias for Testdroid client operations
pub type Result<T> = std::result::Result<T, TestdroidError>;

/// Errors that can occur talking to the Testdroid API
#[derive(Error, Debug)]
pub enum TestdroidError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Server returned an error response
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Timeout
    #[error("Request timed out")]
    Timeout,
}

impl TestdroidError {
    /// Create a server error from status code and message
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }
}

impl From<TestdroidError> for FarmError {
    fn from(e: TestdroidError) -> Self {
        match e {
            TestdroidError::NotFound(msg) => FarmError::NotFound(msg),
            TestdroidError::AuthFailed(msg) => FarmError::Unauthorized(msg),
            TestdroidError::InvalidUrl(e) => FarmError::Internal(e.to_string()),
            other => FarmError::Remote(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_farm_error() {
        let e: FarmError = TestdroidError::NotFound("device 4".into()).into();
        assert!(matches!(e, FarmError::NotFound(_)));

        let e: FarmError = TestdroidError::server_error(503, "busy").into();
        assert!(matches!(e, FarmError::Remote(_)));
        assert!(e.is_transient());

        let e: FarmError = TestdroidError::AuthFailed("bad password".into()).into();
        assert!(matches!(e, FarmError::Unauthorized(_)));
    }
}
