//! Keymaster Gatekeeper Library
//!
//! The per-site agent that keeps door controllers in step with the Keymaster:
//! - Encrypted request/response channel to the Keymaster
//! - Door driver interface with HID VertX and in-memory implementations
//! - Door state, code reconciliation and event forwarding
//! - Heartbeat and event-watcher polling loops
//! - Supervisor tying boot, loops and acknowledgements together

pub mod app;
pub mod backoff;
pub mod channel;
pub mod driver;
pub mod error;
pub mod gatekeeper;
pub mod heartbeat;
pub mod keymaster;
pub mod watcher;

pub use app::{BootOptions, GatekeeperApp};
pub use error::{GatekeeperError, Result};
pub use gatekeeper::{ApplyReceipt, DoorHandle, Gatekeeper};
pub use heartbeat::{HeartbeatLoop, HeartbeatState, PollOutcome};
pub use keymaster::KeymasterClient;
pub use watcher::EventWatcher;
