//! Encrypted request/response channel to the Keymaster.
//!
//! One call is one HTTP round-trip: the request token and optional data are
//! sealed with the site key, posted as form fields, and the sealed reply is
//! opened before it is handed back. Retrying is the caller's job.

pub mod client;
pub mod error;

pub use client::{EncryptedChannel, KeymasterLink};
pub use error::ChannelError;
