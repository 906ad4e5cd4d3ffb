//! Configuration resolution for Gatekeeper agents.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. JSON config file (`gatekeeper.json`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)
//!
//! The resolved configuration is immutable for the life of the process and is
//! handed explicitly to the channel and loop constructors.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Complete Gatekeeper agent configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Keymaster endpoint, e.g. `https://example.org/keymaster/`.
    pub keymaster_url: String,
    /// URL-safe base64 shared key for this site.
    pub keymaster_secret: String,
    /// Delay between `CHECK_DOOR_CODES` polls.
    pub keymaster_poll_delay_secs: u64,
    /// Delay between door event-log polls.
    pub event_poll_delay_secs: u64,
    /// How many events to pull per door when forwarding.
    pub event_sync_count: usize,
    /// Bound on every Keymaster round-trip.
    pub request_timeout_secs: u64,
    /// Maximum accepted age of an encrypted reply.
    pub message_ttl_secs: u64,
    /// Card code that toggles a door's lock when presented.
    pub magic_key: Option<String>,
    /// Set door clocks after configuration.
    pub sync_clocks: bool,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            keymaster_url: String::new(),
            keymaster_secret: String::new(),
            keymaster_poll_delay_secs: 5,
            event_poll_delay_secs: 10,
            event_sync_count: 100,
            request_timeout_secs: 30,
            message_ttl_secs: 600,
            magic_key: None,
            sync_clocks: true,
        }
    }
}

impl std::fmt::Debug for GatekeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatekeeperConfig")
            .field("keymaster_url", &self.keymaster_url)
            .field("keymaster_secret", &"***")
            .field("keymaster_poll_delay_secs", &self.keymaster_poll_delay_secs)
            .field("event_poll_delay_secs", &self.event_poll_delay_secs)
            .field("event_sync_count", &self.event_sync_count)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("message_ttl_secs", &self.message_ttl_secs)
            .field("magic_key", &self.magic_key.as_ref().map(|_| "***"))
            .field("sync_clocks", &self.sync_clocks)
            .finish()
    }
}

impl GatekeeperConfig {
    pub const fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.keymaster_poll_delay_secs)
    }

    pub const fn event_poll_delay(&self) -> Duration {
        Duration::from_secs(self.event_poll_delay_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    /// Fail fast on settings the agent cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.keymaster_url.trim().is_empty() {
            return Err(Error::Config("Missing keymaster_url".into()));
        }
        if !(self.keymaster_url.starts_with("http://") || self.keymaster_url.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "keymaster_url must be http(s): {}",
                self.keymaster_url
            )));
        }
        if self.keymaster_secret.trim().is_empty() {
            return Err(Error::Config("Missing keymaster_secret".into()));
        }
        if self.keymaster_poll_delay_secs == 0 || self.event_poll_delay_secs == 0 {
            return Err(Error::Config("Poll delays must be at least 1 second".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".into()));
        }
        if self.event_sync_count == 0 {
            return Err(Error::Config("event_sync_count must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration: defaults, then `path` if given, then environment.
///
/// A missing file is an error when `path` is given explicitly.
pub fn load_config(path: Option<&Path>) -> Result<GatekeeperConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => GatekeeperConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<GatekeeperConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn apply_env_overrides(config: &mut GatekeeperConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut GatekeeperConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("KEYMASTER_URL") {
        debug!(key = "KEYMASTER_URL", "Config overridden from environment");
        config.keymaster_url = val;
    }
    if let Some(val) = var("KEYMASTER_SECRET") {
        debug!(key = "KEYMASTER_SECRET", "Config overridden from environment");
        config.keymaster_secret = val;
    }
    if let Some(n) = parsed(&var, "KEYMASTER_POLL_DELAY_SEC") {
        config.keymaster_poll_delay_secs = n;
    }
    if let Some(n) = parsed(&var, "EVENT_POLL_DELAY_SEC") {
        config.event_poll_delay_secs = n;
    }
    if let Some(n) = parsed(&var, "EVENT_SYNC_COUNT") {
        config.event_sync_count = n;
    }
}

/// Numeric override; a value that does not parse is ignored with a warning.
fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(n) => {
            debug!(key, "Config overridden from environment");
            Some(n)
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}
