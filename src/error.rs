//! Error types for relink.

use thiserror::Error;

/// Main error type for all relink operations.
#[derive(Debug, Error)]
pub enum RelinkError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (oversized line, malformed stream, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client or server has been closed.
    #[error("closed")]
    Closed,

    /// `start` was called while the listener is already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Result type alias using RelinkError.
pub type Result<T> = std::result::Result<T, RelinkError>;
