//! SQLite storage for the Keymaster server.
//!
//! Provides persistence for sites, doors, door codes, door events and the
//! failure reports Gatekeepers push upstream.

mod db;
mod models;
mod queries;

#[cfg(test)]
mod tests;

pub use db::{DatabaseError, KeymasterDatabase};
pub use models::*;
