//! Gatekeeper error taxonomy.

use crate::channel::ChannelError;
use crate::driver::DriverError;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Errors raised by the Gatekeeper agent.
#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    /// Missing key/endpoint or unusable door configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network, timeout or decrypt failure. Retried on the next tick.
    #[error("Transport error: {0}")]
    Transport(#[from] ChannelError),

    /// Reply outside the vocabulary for the request. Logged, treated as no-op.
    #[error("Protocol error: {0}")]
    Protocol(keymaster_core::Error),

    /// A single door failed; other doors are unaffected.
    #[error("Door '{door}': {source}")]
    Driver {
        door: String,
        #[source]
        source: DriverError,
    },

    /// Applying codes failed on at least one door.
    #[error("Failed to apply door codes on {} door(s): {}", failures.len(), describe(failures))]
    Apply { failures: Vec<(String, DriverError)> },

    /// The Keymaster did not acknowledge `MARK_SUCCESS`.
    #[error("Keymaster desync: {0}")]
    Desync(String),

    #[error("Door not configured: {0}")]
    DoorNotFound(String),
}

impl From<keymaster_core::Error> for GatekeeperError {
    fn from(e: keymaster_core::Error) -> Self {
        match e {
            keymaster_core::Error::Config(msg) => Self::Configuration(msg),
            other => Self::Protocol(other),
        }
    }
}

fn describe(failures: &[(String, DriverError)]) -> String {
    failures
        .iter()
        .map(|(door, e)| format!("{door}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}
