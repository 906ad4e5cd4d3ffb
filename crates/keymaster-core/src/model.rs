//! Records exchanged between the Keymaster and Gatekeeper agents.
//!
//! All payloads travel as JSON inside the encrypted channel.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Door controller hardware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorType {
    /// HID VertX controller, XML over HTTPS.
    Hid,
    /// In-memory controller for tests and dry runs.
    Test,
}

impl DoorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hid => "hid",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for DoorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DoorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hid" => Ok(Self::Hid),
            "test" => Ok(Self::Test),
            other => Err(Error::Config(format!("Unknown door type: {other}"))),
        }
    }
}

/// One door as configured on the Keymaster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorRecord {
    /// Unique within a site.
    pub name: String,
    pub door_type: DoorType,
    pub ip_address: String,
    pub username: String,
    pub password: String,
    /// Timestamp of the newest event the Keymaster has stored for this door.
    #[serde(default)]
    pub last_event_ts: Option<NaiveDateTime>,
}

impl fmt::Debug for DoorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoorRecord")
            .field("name", &self.name)
            .field("door_type", &self.door_type)
            .field("ip_address", &self.ip_address)
            .field("username", &self.username)
            .field("password", &"***")
            .field("last_event_ts", &self.last_event_ts)
            .finish()
    }
}

/// A door credential as issued by the Keymaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorCode {
    /// Card number; unique across the Keymaster.
    pub code: String,
    /// Owner of the credential.
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl DoorCode {
    pub fn new(code: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            username: username.into(),
            first_name: None,
            last_name: None,
            created_by: None,
            modified_at: None,
        }
    }

    /// "First Last", falling back to the username.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self.username.clone(),
        }
    }
}

/// Codes delivered in reply to `PULL_DOOR_CODES` or `FORCE_SYNC`.
///
/// A plain JSON list is a delta, and `[]` means "no changes". The object form
/// `{"snapshot": [..]}` is the complete active set and is authoritative even
/// when empty, so revoking the last code still empties the doors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeDelivery {
    Delta(Vec<DoorCode>),
    Snapshot { snapshot: Vec<DoorCode> },
}

impl CodeDelivery {
    pub const fn unchanged() -> Self {
        Self::Delta(Vec::new())
    }

    pub const fn snapshot(codes: Vec<DoorCode>) -> Self {
        Self::Snapshot { snapshot: codes }
    }

    pub fn codes(&self) -> &[DoorCode] {
        match self {
            Self::Delta(codes) | Self::Snapshot { snapshot: codes } => codes,
        }
    }

    /// Whether the doors must end up holding exactly [`Self::codes`].
    pub fn is_authoritative(&self) -> bool {
        match self {
            Self::Delta(codes) => !codes.is_empty(),
            Self::Snapshot { .. } => true,
        }
    }
}

/// What happened at a door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorEventType {
    Unknown,
    UnrecognizedCard,
    AccessGranted,
    AccessDenied,
    DoorLocked,
    DoorUnlocked,
}

impl DoorEventType {
    /// Single-character storage code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unknown => "0",
            Self::UnrecognizedCard => "1",
            Self::AccessGranted => "2",
            Self::AccessDenied => "3",
            Self::DoorLocked => "4",
            Self::DoorUnlocked => "5",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => Self::UnrecognizedCard,
            "2" => Self::AccessGranted,
            "3" => Self::AccessDenied,
            "4" => Self::DoorLocked,
            "5" => Self::DoorUnlocked,
            _ => Self::Unknown,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown Command",
            Self::UnrecognizedCard => "Unrecognized Card",
            Self::AccessGranted => "Access Granted",
            Self::AccessDenied => "Access Denied",
            Self::DoorLocked => "Door Locked",
            Self::DoorUnlocked => "Door Unlocked",
        }
    }
}

/// An event observed at a door controller. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorEvent {
    /// Controller-local wall clock time.
    pub timestamp: NaiveDateTime,
    /// Card number presented, when the controller reports one.
    #[serde(default)]
    pub code: Option<String>,
    pub event_type: DoorEventType,
    pub description: String,
    /// Cardholder the controller resolved the card to, if any.
    #[serde(default)]
    pub username: Option<String>,
}

impl DoorEvent {
    /// Newest event of a sequence, by timestamp.
    pub fn newest(events: &[Self]) -> Option<&Self> {
        events.iter().max_by_key(|e| e.timestamp)
    }
}

/// Door events grouped by door name, as pushed to the Keymaster.
pub type EventBatch = BTreeMap<String, Vec<DoorEvent>>;
