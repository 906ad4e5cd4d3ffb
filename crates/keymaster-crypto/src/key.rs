//! Shared secret keys.
//!
//! A key is 32 random bytes. On disk and in configuration it travels as
//! URL-safe base64 with padding, which is always 44 characters long.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Raw key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Shared secret between one Gatekeeper site and the Keymaster.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parse a URL-safe base64 encoded key.
    ///
    /// Surrounding whitespace is ignored; an empty string is reported as a
    /// missing key rather than a malformed one.
    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(CryptoError::MissingKey);
        }
        let mut decoded = URL_SAFE
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        if decoded.len() != KEY_SIZE {
            let actual = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual,
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Build a key from raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Encode the key for configuration files.
    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.bytes)
    }

    pub(crate) const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Generate a new encoded key, ready to paste into a site's configuration.
pub fn generate_key() -> String {
    SecretKey::generate().encode()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_44_url_safe_chars() {
        let encoded = generate_key();
        assert_eq!(encoded.len(), 44);
        assert!(
            encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '='))
        );
    }

    #[test]
    fn parse_accepts_encoded_key() {
        let key = SecretKey::generate();
        let parsed = SecretKey::parse(&key.encode()).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn parse_trims_whitespace() {
        let encoded = format!("  {}\n", generate_key());
        assert!(SecretKey::parse(&encoded).is_ok());
    }

    #[test]
    fn empty_key_is_missing() {
        assert!(matches!(SecretKey::parse(""), Err(CryptoError::MissingKey)));
        assert!(matches!(SecretKey::parse("   "), Err(CryptoError::MissingKey)));
    }

    #[test]
    fn short_key_is_rejected() {
        let encoded = URL_SAFE.encode([7u8; 16]);
        assert!(matches!(
            SecretKey::parse(&encoded),
            Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: 16
            })
        ));
    }

    #[test]
    fn non_base64_key_is_rejected() {
        assert!(matches!(
            SecretKey::parse("not a key!"),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = SecretKey::from_bytes([42u8; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "SecretKey(..)");
    }
}
