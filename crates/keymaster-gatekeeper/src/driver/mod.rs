//! Door controller drivers.
//!
//! Callers only ever see [`DoorDriver`]; new hardware families are added by
//! implementing the trait and teaching [`StandardDriverFactory`] the type.

pub mod hid;
mod hid_xml;
pub mod reconcile;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use keymaster_core::{DoorCode, DoorEvent, DoorRecord, DoorType};

pub use hid::HidDoorDriver;
pub use test::{TestDoorDriver, TestDriverFactory};

/// Errors reported by a door driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The controller could not be reached. Try again next cycle.
    #[error("Door controller unreachable: {0}")]
    Connectivity(String),

    /// The controller refused or failed a command.
    #[error("Door command failed: {0}")]
    Command(String),

    /// The controller answered with something the driver cannot read.
    #[error("Unreadable controller reply: {0}")]
    Protocol(String),
}

/// A credential as stored on a controller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Credential {
    /// Controller-side cardholder id, when the controller has one.
    pub holder_id: Option<String>,
    pub username: String,
    pub code: String,
}

/// One step of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialChange {
    /// New cardholder with a credential.
    Add { code: DoorCode },
    /// Existing cardholder moves from `old_code` to `new_code`.
    Change {
        holder_id: Option<String>,
        username: String,
        old_code: String,
        new_code: String,
    },
    /// Credential (and its cardholder) no longer authorized.
    Remove { credential: Credential },
}

/// Controller-reported door state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorStatus {
    pub name: String,
    pub locked: bool,
}

/// Capability interface over door hardware.
#[async_trait]
pub trait DoorDriver: Send + Sync {
    /// Cheap reachability probe.
    async fn test_connection(&self) -> Result<(), DriverError>;

    async fn lock(&self) -> Result<(), DriverError>;

    async fn unlock(&self) -> Result<(), DriverError>;

    async fn is_locked(&self) -> Result<bool, DriverError>;

    /// Doors (relays) the controller manages.
    async fn list_doors(&self) -> Result<Vec<DoorStatus>, DriverError>;

    /// One page of stored credentials. A short page means the end.
    async fn list_credentials(
        &self,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Credential>, DriverError>;

    /// Apply a planned set of changes, in order.
    async fn apply_changes(&self, changes: &[CredentialChange]) -> Result<(), DriverError>;

    /// Up to `records` most recent events, newest first.
    async fn pull_event_log(&self, records: usize) -> Result<Vec<DoorEvent>, DriverError>;

    /// Set the controller's wall clock.
    async fn sync_clock(&self, now: NaiveDateTime) -> Result<(), DriverError>;
}

/// Builds a driver for a configured door.
pub trait DriverFactory: Send + Sync {
    fn create(&self, record: &DoorRecord) -> Result<Arc<dyn DoorDriver>, DriverError>;
}

/// Production factory: HID controllers over HTTPS, test doors in memory.
#[derive(Debug, Default)]
pub struct StandardDriverFactory;

impl DriverFactory for StandardDriverFactory {
    fn create(&self, record: &DoorRecord) -> Result<Arc<dyn DoorDriver>, DriverError> {
        Ok(match record.door_type {
            DoorType::Hid => Arc::new(HidDoorDriver::new(record)?),
            DoorType::Test => Arc::new(TestDoorDriver::new(&record.name)),
        })
    }
}
