//! Error types for lumen-link.

use thiserror::Error;

/// Errors surfaced by lumen-link operations.
#[derive(Error, Debug)]
pub enum LumenLinkError {
    /// Input rejected before any network activity (empty topic, bad URL, ...).
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Client construction or option error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Transport-level failure (TCP, TLS, HTTP, stream ended unexpectedly).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// WebSocket handshake or frame-level failure.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// A bounded wait elapsed (connect, ack, ...).
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The server answered an HTTP request with a non-success status.
    #[error("Server error ({status_code}): {message}")]
    ServerError { status_code: u16, message: String },

    /// The server reported an error frame for a correlated request.
    #[error("Server rejected request: {0}")]
    RequestRejected(String),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The connection was closed while the operation was still pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invariant violation inside the client itself.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type for lumen-link operations.
pub type Result<T> = std::result::Result<T, LumenLinkError>;

impl From<reqwest::Error> for LumenLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LumenLinkError::TimeoutError(err.to_string())
        } else if err.is_decode() {
            LumenLinkError::SerializationError(err.to_string())
        } else {
            LumenLinkError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LumenLinkError {
    fn from(err: serde_json::Error) -> Self {
        LumenLinkError::SerializationError(err.to_string())
    }
}
