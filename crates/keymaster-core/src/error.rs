//! Error types for the Keymaster core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A response that is outside the vocabulary expected for the request
    #[error("Unexpected response to '{request}': {response:?}")]
    UnexpectedResponse { request: String, response: String },

    /// A request token that is not part of the protocol
    #[error("Unknown request: {0:?}")]
    UnknownRequest(String),

    /// JSON payload serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
