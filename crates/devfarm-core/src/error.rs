//! Error types for device acquisition and flashing

use thiserror::Error;

use crate::models::RunState;

/// Result type for orchestrator and cloud operations
pub type FarmResult<T> = Result<T, FarmError>;

/// Errors that can occur while talking to the device cloud or orchestrating it
#[derive(Debug, Error)]
pub enum FarmError {
    /// Caller supplied an unusable request (missing filter keys, zero budget)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Orchestrator settings are out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Flashing filter matched no online, unlocked device
    #[error("No candidate device online and unlocked for filter {0}")]
    NoCandidateDevice(String),

    /// Flash run did not reach the finished state before the deadline
    #[error("Flash run {run_id} timed out after {elapsed_secs}s (last state: {state})")]
    FlashTimeout {
        run_id: u64,
        state: RunState,
        elapsed_secs: u64,
    },

    /// Flash run ended but reported a failed outcome
    #[error("Flash run {run_id} failed in state {state}: {reason}")]
    FlashJobFailed {
        run_id: u64,
        state: RunState,
        reason: String,
    },

    /// Every candidate device refused a session and the retry budget ran out
    #[error("No device session available after {attempts} acquisition attempts")]
    NoSessionAvailable { attempts: u32 },

    /// Session obtained but a protocol proxy could not be created
    #[error("Failed to create {protocol} proxy for session {session_id}: {message}")]
    ProxyCreationFailed {
        protocol: String,
        session_id: u64,
        message: String,
    },

    /// Remote resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote call failed (network error, 5xx, malformed response)
    #[error("Remote error: {0}")]
    Remote(String),

    /// Remote rejected our credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// URL could not be signed or a signature did not verify
    #[error("Signature error: {0}")]
    Signature(String),

    /// Operation not supported by this cloud implementation
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FarmError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            FarmError::InvalidRequest(_) => 400,
            FarmError::InvalidConfig(_) => 500,
            FarmError::NoCandidateDevice(_) => 503,
            FarmError::FlashTimeout { .. } => 504,
            FarmError::FlashJobFailed { .. } => 502,
            FarmError::NoSessionAvailable { .. } => 503,
            FarmError::ProxyCreationFailed { .. } => 502,
            FarmError::NotFound(_) => 404,
            FarmError::Remote(_) => 502,
            FarmError::Unauthorized(_) => 502,
            FarmError::Signature(_) => 400,
            FarmError::NotSupported(_) => 501,
            FarmError::Internal(_) => 500,
        }
    }

    /// Whether a bounded retry loop should swallow this error and try again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FarmError::Remote(_) | FarmError::NotFound(_) | FarmError::Unauthorized(_)
        )
    }
}
