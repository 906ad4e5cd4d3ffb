//! Data models for Keymaster storage.

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;

use keymaster_core::time::DOOR_TS_FORMAT;
use keymaster_core::{DoorCode, DoorEventType, DoorRecord, DoorType};

use super::db::DatabaseError;

/// One Gatekeeper installation, identified by the IP it calls in from.
#[derive(Clone, sqlx::FromRow)]
pub struct Site {
    pub id: i64,
    pub description: String,
    pub gatekeeper_ip: String,
    pub encryption_key: String,
    pub access_at: Option<i64>,
    pub success_at: Option<i64>,
    pub sync_at: Option<i64>,
    pub pending_sync_at: Option<i64>,
    pub is_syncing: bool,
    pub is_enabled: bool,
    pub created_at: i64,
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("gatekeeper_ip", &self.gatekeeper_ip)
            .field("sync_at", &self.sync_at)
            .field("is_syncing", &self.is_syncing)
            .field("is_enabled", &self.is_enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, sqlx::FromRow)]
pub struct Door {
    pub id: i64,
    pub site_id: i64,
    pub name: String,
    pub door_type: String,
    pub ip_address: String,
    pub username: String,
    pub password: String,
}

impl Door {
    /// Configuration record as sent to the Gatekeeper.
    pub fn to_record(
        &self,
        last_event_ts: Option<NaiveDateTime>,
    ) -> Result<DoorRecord, DatabaseError> {
        let door_type: DoorType = self
            .door_type
            .parse()
            .map_err(|e| DatabaseError::Corrupt(format!("door {}: {e}", self.name)))?;
        Ok(DoorRecord {
            name: self.name.clone(),
            door_type,
            ip_address: self.ip_address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            last_event_ts,
        })
    }
}

impl std::fmt::Debug for Door {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Door")
            .field("id", &self.id)
            .field("site_id", &self.site_id)
            .field("name", &self.name)
            .field("door_type", &self.door_type)
            .field("ip_address", &self.ip_address)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DoorCodeRow {
    pub id: i64,
    pub code: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub modified_at: i64,
    pub revoked: bool,
}

impl DoorCodeRow {
    pub fn to_door_code(&self) -> DoorCode {
        DoorCode {
            code: self.code.clone(),
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            created_by: self.created_by.clone(),
            modified_at: DateTime::from_timestamp_millis(self.modified_at),
        }
    }
}

/// Fields for creating or replacing a door code.
#[derive(Debug, Clone, Default)]
pub struct CodeParams<'a> {
    pub code: &'a str,
    pub username: &'a str,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub created_by: Option<&'a str>,
}

/// A stored door event joined with its door's name.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DoorEventRow {
    pub id: i64,
    pub door_id: i64,
    pub door_name: String,
    pub timestamp: String,
    pub code: String,
    pub username: Option<String>,
    pub event_type: String,
    pub description: String,
    pub received_at: i64,
}

impl DoorEventRow {
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, DOOR_TS_FORMAT).ok()
    }

    pub fn event_type(&self) -> DoorEventType {
        DoorEventType::from_code(&self.event_type)
    }

    pub fn code(&self) -> Option<&str> {
        Some(self.code.as_str()).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GatekeeperLog {
    pub id: i64,
    pub site_id: i64,
    pub message: String,
    pub created_at: i64,
}
