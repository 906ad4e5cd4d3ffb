//! Authenticated message tokens.
//!
//! Token layout before base64 encoding:
//!
//! ```text
//! [1-byte version][8-byte issued_at (big-endian secs)][12-byte nonce][ciphertext + 16-byte tag]
//! ```
//!
//! The version byte and timestamp are bound to the ciphertext as associated
//! data, so neither can be altered without failing authentication. Nonces are
//! random: many agents encrypt under the same long-lived key, so a per-process
//! counter could not guarantee uniqueness.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::key::SecretKey;

/// HKDF info string for message key derivation.
const HKDF_INFO: &[u8] = b"keymaster-message-v1";

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"keymaster-hkdf-salt-v1";

/// Format version tag, first byte of every token.
const TOKEN_VERSION: u8 = 0x91;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

const HEADER_SIZE: usize = 1 + 8;
const TAG_SIZE: usize = 16;

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// How far in the future a token's timestamp may be before it is rejected.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Derive a 32-byte key from the shared secret via HKDF-SHA256.
///
/// The caller is responsible for zeroizing the returned bytes.
fn hkdf_derive(shared_secret: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Encrypts and decrypts message tokens under one shared key.
///
/// Stateless apart from the key, so a single instance can be shared between
/// concurrent callers.
pub struct TokenCipher {
    cipher: ChaCha20Poly1305,
    ttl: Duration,
}

impl TokenCipher {
    /// Create a cipher with the default token TTL.
    pub fn new(key: &SecretKey) -> Result<Self, CryptoError> {
        Self::with_ttl(key, DEFAULT_TTL)
    }

    /// Create a cipher that rejects tokens older than `ttl`.
    pub fn with_ttl(key: &SecretKey, ttl: Duration) -> Result<Self, CryptoError> {
        let mut key_bytes = hkdf_derive(key.as_bytes())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        key_bytes.zeroize();
        Ok(Self { cipher, ttl })
    }

    /// Parse an encoded key and build a cipher in one step.
    pub fn from_encoded_key(encoded: &str, ttl: Duration) -> Result<Self, CryptoError> {
        Self::with_ttl(&SecretKey::parse(encoded)?, ttl)
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Seal plaintext into a URL-safe token stamped with the current time.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.encrypt_at(plaintext, now_secs())
    }

    /// Seal plaintext with an explicit issue time.
    pub fn encrypt_at(&self, plaintext: &[u8], issued_at: u64) -> Result<String, CryptoError> {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = TOKEN_VERSION;
        header[1..].copy_from_slice(&issued_at.to_be_bytes());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut raw = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&header);
        raw.extend_from_slice(&nonce_bytes);
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(raw))
    }

    /// Open a token, enforcing the TTL against the current time.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_at(token, now_secs())
    }

    /// Open a token, enforcing the TTL against `now` (unix seconds).
    ///
    /// Nothing is returned unless the whole token authenticates.
    pub fn decrypt_at(&self, token: &str, now: u64) -> Result<Vec<u8>, CryptoError> {
        let raw = URL_SAFE
            .decode(token.trim())
            .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
        if raw.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::MalformedToken(format!(
                "token too short ({} bytes)",
                raw.len()
            )));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(CryptoError::MalformedToken(format!(
                "unknown token version 0x{:02x}",
                raw[0]
            )));
        }

        let (header, rest) = raw.split_at(HEADER_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&header[1..]);
        let issued_at = u64::from_be_bytes(ts_bytes);

        if issued_at > now {
            let ahead_secs = issued_at - now;
            if ahead_secs > MAX_CLOCK_SKEW.as_secs() {
                return Err(CryptoError::TokenFromFuture { ahead_secs });
            }
        } else {
            let age_secs = now - issued_at;
            if age_secs > self.ttl.as_secs() {
                return Err(CryptoError::TokenExpired {
                    age_secs,
                    ttl_secs: self.ttl.as_secs(),
                });
            }
        }

        Ok(plaintext)
    }

    /// Encrypt a UTF-8 message.
    pub fn encrypt_str(&self, message: &str) -> Result<String, CryptoError> {
        self.encrypt(message.as_bytes())
    }

    /// Decrypt a token that must contain UTF-8 text.
    pub fn decrypt_str(&self, token: &str) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(token)?)
            .map_err(|e| CryptoError::DecryptionFailed(format!("plaintext is not UTF-8: {e}")))
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cipher_pair() -> (TokenCipher, TokenCipher) {
        let key = SecretKey::generate();
        (
            TokenCipher::new(&key).unwrap(),
            TokenCipher::new(&key).unwrap(),
        )
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt_str("Are you the Keymaster?").unwrap();
        let plaintext = keymaster.decrypt_str(&token).unwrap();
        assert_eq!(plaintext, "Are you the Keymaster?");
    }

    #[test]
    fn encrypt_empty_message() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt(b"").unwrap();
        assert!(keymaster.decrypt(&token).unwrap().is_empty());
    }

    #[test]
    fn token_is_url_safe() {
        let (agent, _) = cipher_pair();
        let token = agent.encrypt(&[0xFBu8; 300]).unwrap();
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let (agent, _) = cipher_pair();
        let (_, stranger) = cipher_pair();

        let token = agent.encrypt_str("pull_door_codes").unwrap();
        let result = stranger.decrypt(&token);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn decrypt_with_tampered_ciphertext_fails() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt_str("mark_success").unwrap();

        let mut raw = URL_SAFE.decode(&token).unwrap();
        if let Some(byte) = raw.last_mut() {
            *byte ^= 0xFF;
        }
        let tampered = URL_SAFE.encode(raw);

        assert!(matches!(
            keymaster.decrypt(&tampered),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn rewritten_timestamp_fails_authentication() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt_at(b"check_door_codes", 1_000).unwrap();

        let mut raw = URL_SAFE.decode(&token).unwrap();
        raw[8] ^= 0x01;
        let forged = URL_SAFE.encode(raw);

        assert!(matches!(
            keymaster.decrypt_at(&forged, 1_000),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt_at(b"late", 10_000).unwrap();

        assert!(keymaster.decrypt_at(&token, 10_600).is_ok());
        assert!(matches!(
            keymaster.decrypt_at(&token, 10_601),
            Err(CryptoError::TokenExpired {
                age_secs: 601,
                ttl_secs: 600
            })
        ));
    }

    #[test]
    fn token_from_the_future_is_rejected_beyond_skew() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt_at(b"early", 10_000).unwrap();

        assert!(keymaster.decrypt_at(&token, 10_000 - 60).is_ok());
        assert!(matches!(
            keymaster.decrypt_at(&token, 10_000 - 61),
            Err(CryptoError::TokenFromFuture { ahead_secs: 61 })
        ));
    }

    #[test]
    fn custom_ttl_is_honoured() {
        let key = SecretKey::generate();
        let short = TokenCipher::with_ttl(&key, Duration::from_secs(5)).unwrap();
        let token = short.encrypt_at(b"x", 100).unwrap();
        assert!(short.decrypt_at(&token, 105).is_ok());
        assert!(short.decrypt_at(&token, 106).is_err());
    }

    #[test]
    fn garbage_token_is_malformed() {
        let (_, keymaster) = cipher_pair();
        assert!(matches!(
            keymaster.decrypt("%%%"),
            Err(CryptoError::MalformedToken(_))
        ));
        assert!(matches!(
            keymaster.decrypt(&URL_SAFE.encode([TOKEN_VERSION; 10])),
            Err(CryptoError::MalformedToken(_))
        ));
    }

    #[test]
    fn unknown_version_is_malformed() {
        let (agent, keymaster) = cipher_pair();
        let token = agent.encrypt(b"x").unwrap();
        let mut raw = URL_SAFE.decode(&token).unwrap();
        raw[0] = 0x80;
        assert!(matches!(
            keymaster.decrypt(&URL_SAFE.encode(raw)),
            Err(CryptoError::MalformedToken(_))
        ));
    }

    #[test]
    fn same_plaintext_produces_distinct_tokens() {
        let (agent, _) = cipher_pair();
        let mut tokens = std::collections::HashSet::new();
        for _ in 0..500 {
            assert!(tokens.insert(agent.encrypt_at(b"x", 1).unwrap()));
        }
    }

    #[test]
    fn from_encoded_key_matches_parsed_key() {
        let key = SecretKey::generate();
        let a = TokenCipher::from_encoded_key(&key.encode(), DEFAULT_TTL).unwrap();
        let b = TokenCipher::new(&key).unwrap();
        let token = a.encrypt_str("OK").unwrap();
        assert_eq!(b.decrypt_str(&token).unwrap(), "OK");
    }

    #[test]
    fn from_encoded_key_rejects_missing_key() {
        assert!(matches!(
            TokenCipher::from_encoded_key("", DEFAULT_TTL),
            Err(CryptoError::MissingKey)
        ));
    }
}
