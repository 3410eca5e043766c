//! Error types for trackq-core

use thiserror::Error;

/// Main error type for the trackq-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Preferences database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (staging store lines)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A request string that can never be sent
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    /// Delivery/network error
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Background execution context error
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Result type alias for trackq-core
pub type Result<T> = std::result::Result<T, Error>;
