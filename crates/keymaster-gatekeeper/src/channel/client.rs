//! HTTP transport for sealed Keymaster messages.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use keymaster_core::GatekeeperConfig;
use keymaster_crypto::TokenCipher;

use super::error::ChannelError;

/// Anything that can carry one request to the Keymaster and return its reply.
///
/// Implementations must be safe to share between the heartbeat, the event
/// watcher and the supervisor.
#[async_trait]
pub trait KeymasterLink: Send + Sync {
    /// Send `message` (and optional `data`) and return the plaintext reply.
    async fn send_message(&self, message: &str, data: Option<&str>)
    -> Result<String, ChannelError>;
}

/// JSON body returned by the Keymaster endpoint.
#[derive(Debug, Deserialize)]
struct ReplyBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Encrypted HTTP POST channel.
pub struct EncryptedChannel {
    http: reqwest::Client,
    url: String,
    cipher: TokenCipher,
    timeout: Duration,
}

impl EncryptedChannel {
    /// Build a channel; fails fast when the key or URL is unusable.
    pub fn new(
        url: &str,
        encoded_key: &str,
        timeout: Duration,
        ttl: Duration,
    ) -> Result<Self, ChannelError> {
        if url.trim().is_empty() {
            return Err(ChannelError::Configuration("Missing Keymaster URL".into()));
        }
        let cipher = TokenCipher::from_encoded_key(encoded_key, ttl)
            .map_err(|e| ChannelError::Configuration(format!("Encryption key: {e}")))?;

        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            url: url.to_string(),
            cipher,
            timeout,
        })
    }

    /// Build a channel from the agent configuration.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self, ChannelError> {
        Self::new(
            &config.keymaster_url,
            &config.keymaster_secret,
            config.request_timeout(),
            config.message_ttl(),
        )
    }

    fn map_http_error(&self, e: &reqwest::Error) -> ChannelError {
        if e.is_timeout() {
            ChannelError::Timeout(self.timeout)
        } else {
            ChannelError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl KeymasterLink for EncryptedChannel {
    async fn send_message(
        &self,
        message: &str,
        data: Option<&str>,
    ) -> Result<String, ChannelError> {
        let sealed_message = self
            .cipher
            .encrypt_str(message)
            .map_err(ChannelError::Encrypt)?;
        let mut form = vec![("message", sealed_message)];
        if let Some(data) = data {
            let sealed_data = self.cipher.encrypt_str(data).map_err(ChannelError::Encrypt)?;
            form.push(("data", sealed_data));
        }

        debug!(request = message, url = %self.url, "Sending message to Keymaster");
        let response = self
            .http
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.map_http_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Status(status.as_u16()));
        }

        let body: ReplyBody = response
            .json()
            .await
            .map_err(|e| ChannelError::MalformedReply(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(ChannelError::Server(error));
        }
        let sealed_reply = body
            .message
            .ok_or_else(|| ChannelError::MalformedReply("reply has no message".into()))?;

        self.cipher
            .decrypt_str(&sealed_reply)
            .map_err(ChannelError::Decrypt)
    }
}

impl std::fmt::Debug for EncryptedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keymaster_crypto::generate_key;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn missing_key_is_configuration_error() {
        let result = EncryptedChannel::new("http://localhost/keymaster/", "", TIMEOUT, TTL);
        assert!(matches!(result, Err(ChannelError::Configuration(_))));
    }

    #[test]
    fn malformed_key_is_configuration_error() {
        let result =
            EncryptedChannel::new("http://localhost/keymaster/", "short", TIMEOUT, TTL);
        assert!(matches!(result, Err(ChannelError::Configuration(_))));
    }

    #[test]
    fn missing_url_is_configuration_error() {
        let result = EncryptedChannel::new("", &generate_key(), TIMEOUT, TTL);
        assert!(matches!(result, Err(ChannelError::Configuration(_))));
    }

    #[test]
    fn channel_from_config() {
        let config = GatekeeperConfig {
            keymaster_url: "http://localhost:9/keymaster/".into(),
            keymaster_secret: generate_key(),
            ..Default::default()
        };
        let channel = EncryptedChannel::from_config(&config).unwrap();
        assert_eq!(channel.url, "http://localhost:9/keymaster/");
    }

    #[tokio::test]
    async fn unreachable_keymaster_is_transport_error() {
        // Port 9 (discard) is closed on test machines; the connect fails fast.
        let channel = EncryptedChannel::new(
            "http://127.0.0.1:9/keymaster/",
            &generate_key(),
            Duration::from_secs(2),
            TTL,
        )
        .unwrap();
        let result = channel.send_message("check_door_codes", None).await;
        assert!(matches!(
            result,
            Err(ChannelError::Http(_) | ChannelError::Timeout(_))
        ));
    }
}
