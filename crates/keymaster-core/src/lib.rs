//! Keymaster Core Library
//!
//! Shared functionality for the Keymaster server and Gatekeeper agents:
//! - The closed request/response vocabulary spoken over the encrypted channel
//! - Door, door code and door event records exchanged as JSON payloads
//! - Gatekeeper configuration resolution
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod time;
pub mod tracing_init;

pub use config::GatekeeperConfig;
pub use error::{Error, Result};
pub use model::{
    CodeDelivery, DoorCode, DoorEvent, DoorEventType, DoorRecord, DoorType, EventBatch,
};
pub use protocol::{CheckResult, Request, Response};
