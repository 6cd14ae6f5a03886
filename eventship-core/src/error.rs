//! Error types for eventship-core

use thiserror::Error;

/// Main error type for the eventship-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client construction error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Durable storage error that is not a plain IO failure
    #[error("storage error: {0}")]
    Storage(String),

    /// A single serialized event exceeded the per-event limit
    #[error("event payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The queue or client has been shut down
    #[error("client has been shut down")]
    ClientShutdown,

    /// The data plane rejected the write key; the client is permanently disabled
    #[error("write key was rejected by the data plane")]
    InvalidWriteKey,
}

/// Result type alias for eventship-core
pub type Result<T> = std::result::Result<T, Error>;
