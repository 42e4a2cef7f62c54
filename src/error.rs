//! Error handling for camwatch.

use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum OurError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A path that does not name a video4linux device node
    #[error("Invalid device path: {0}")]
    InvalidDevice(String),

    /// Per-device detection failures
    #[error("Detection error: {0}")]
    Detection(String),

    /// Monitor lifecycle errors
    #[error("Monitor error: {0}")]
    Monitor(String),

    /// HTTP/WebSocket server errors
    #[error("Server error: {0}")]
    Server(String),
}

/// Application result type
pub type OurResult<T> = std::result::Result<T, OurError>;
