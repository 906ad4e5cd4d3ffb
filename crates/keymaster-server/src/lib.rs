//! Keymaster server.
//!
//! Stores sites, doors, door codes and door events, and answers the encrypted
//! requests of each site's Gatekeeper agent over HTTP.

pub mod http;
pub mod service;
pub mod storage;

pub use service::{KeymasterService, ServiceError};
pub use storage::{DatabaseError, KeymasterDatabase};
