//! Keymaster message encryption.
//!
//! Every message exchanged between a Gatekeeper agent and the Keymaster is
//! sealed into an opaque, URL-safe token with a key both ends share.
//!
//! ## Crypto primitives
//!
//! - **Key**: 32 random bytes, shipped as URL-safe base64 (44 chars)
//! - **Derivation**: HKDF-SHA256 turns the shared secret into the AEAD key
//! - **Encryption**: ChaCha20-Poly1305 AEAD, 12-byte random nonce, issue
//!   timestamp authenticated as associated data

pub mod error;
pub mod key;
pub mod token;

pub use error::CryptoError;
pub use key::{KEY_SIZE, SecretKey, generate_key};
pub use token::{DEFAULT_TTL, MAX_CLOCK_SKEW, NONCE_SIZE, TokenCipher};
