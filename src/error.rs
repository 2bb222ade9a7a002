//! Error types for the relay.

use thiserror::Error;

/// Errors raised by the relay's collaborators and boundaries.
///
/// Router and reply handlers return these; the dispatch boundary logs them and
/// keeps going, so none of them terminate the process.
#[derive(Error, Debug)]
pub enum RelayError {
    /// An error envelope returned by the platform open API.
    #[error("platform error ({code}): {msg}")]
    Platform {
        /// Non-zero `code` from the platform envelope.
        code: i64,
        /// The accompanying `msg` field.
        msg: String,
    },

    /// An HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload that could not be interpreted.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The worker socket is not connected.
    #[error("worker socket not connected")]
    NotConnected,
}

impl RelayError {
    pub fn platform(code: i64, msg: impl Into<String>) -> Self {
        Self::Platform {
            code,
            msg: msg.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPayload(reason.into())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
