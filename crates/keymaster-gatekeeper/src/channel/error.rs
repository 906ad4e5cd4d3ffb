//! Channel error types.

use keymaster_crypto::CryptoError;

/// Errors that can occur on the encrypted channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Missing or invalid key or endpoint. Fatal at startup.
    #[error("Channel configuration error: {0}")]
    Configuration(String),

    #[error("Failed to encrypt message: {0}")]
    Encrypt(#[source] CryptoError),

    /// The reply could not be authenticated or decoded; nothing from it is used.
    #[error("Failed to decrypt reply: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Keymaster returned HTTP {0}")]
    Status(u16),

    /// The Keymaster answered with an explicit error.
    #[error("Keymaster error: {0}")]
    Server(String),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}
