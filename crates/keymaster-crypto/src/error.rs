//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Missing encryption key")]
    MissingKey,

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token expired: issued {age_secs}s ago, ttl is {ttl_secs}s")]
    TokenExpired { age_secs: u64, ttl_secs: u64 },

    #[error("Token issued {ahead_secs}s in the future")]
    TokenFromFuture { ahead_secs: u64 },
}
