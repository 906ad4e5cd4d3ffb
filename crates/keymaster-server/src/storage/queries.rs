//! Database queries for the Keymaster server.

use chrono::NaiveDateTime;

use keymaster_core::DoorEvent;
use keymaster_core::time::{DOOR_TS_FORMAT, format_door_ts};

use super::db::{DatabaseError, KeymasterDatabase};
use super::models::{CodeParams, Door, DoorCodeRow, DoorEventRow, GatekeeperLog, Site};

impl KeymasterDatabase {
    // =========================================================================
    // Site queries
    // =========================================================================

    /// Register a site for a Gatekeeper IP.
    pub async fn create_site(
        &self,
        description: &str,
        gatekeeper_ip: &str,
        encryption_key: &str,
        is_enabled: bool,
        now: i64,
    ) -> Result<Site, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO sites (description, gatekeeper_ip, encryption_key, is_enabled, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(description)
        .bind(gatekeeper_ip)
        .bind(encryption_key)
        .bind(is_enabled)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_site(result.last_insert_rowid()).await
    }

    /// Get a site by ID.
    pub async fn get_site(&self, id: i64) -> Result<Site, DatabaseError> {
        sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Site {id}")))
    }

    /// Find the site a Gatekeeper IP belongs to.
    pub async fn get_site_by_ip(&self, gatekeeper_ip: &str) -> Result<Option<Site>, DatabaseError> {
        let site = sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE gatekeeper_ip = ?")
            .bind(gatekeeper_ip)
            .fetch_optional(self.pool())
            .await?;

        Ok(site)
    }

    /// Like [`get_site_by_ip`](Self::get_site_by_ip) but missing is an error.
    pub async fn require_site_by_ip(&self, gatekeeper_ip: &str) -> Result<Site, DatabaseError> {
        self.get_site_by_ip(gatekeeper_ip)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Site for IP {gatekeeper_ip}")))
    }

    pub async fn list_sites(&self) -> Result<Vec<Site>, DatabaseError> {
        let sites = sqlx::query_as::<_, Site>("SELECT * FROM sites ORDER BY id")
            .fetch_all(self.pool())
            .await?;

        Ok(sites)
    }

    pub async fn set_site_enabled(&self, id: i64, is_enabled: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE sites SET is_enabled = ? WHERE id = ?")
            .bind(is_enabled)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_site_key(&self, id: i64, encryption_key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE sites SET encryption_key = ? WHERE id = ?")
            .bind(encryption_key)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the site's Gatekeeper called in.
    pub async fn touch_site(&self, id: i64, now: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sites SET access_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// A code snapshot was served; it counts once acknowledged.
    pub async fn begin_sync(&self, id: i64, now: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sites SET is_syncing = 1, pending_sync_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Record an acknowledgement, committing a pending sync if there is one.
    pub async fn mark_success(&self, id: i64, now: i64) -> Result<Site, DatabaseError> {
        sqlx::query(
            "UPDATE sites SET success_at = ?, \
             sync_at = CASE WHEN is_syncing = 1 THEN pending_sync_at ELSE sync_at END, \
             pending_sync_at = NULL, is_syncing = 0 WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_site(id).await
    }

    /// Forget the last sync so the next check reports new data.
    pub async fn force_sync(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE sites SET sync_at = NULL WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Door queries
    // =========================================================================

    pub async fn create_door(
        &self,
        site_id: i64,
        name: &str,
        door_type: &str,
        ip_address: &str,
        username: &str,
        password: &str,
    ) -> Result<Door, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO doors (site_id, name, door_type, ip_address, username, password) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(site_id)
        .bind(name)
        .bind(door_type)
        .bind(ip_address)
        .bind(username)
        .bind(password)
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        sqlx::query_as::<_, Door>("SELECT * FROM doors WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Door {id}")))
    }

    pub async fn list_doors(&self, site_id: i64) -> Result<Vec<Door>, DatabaseError> {
        let doors = sqlx::query_as::<_, Door>("SELECT * FROM doors WHERE site_id = ? ORDER BY name")
            .bind(site_id)
            .fetch_all(self.pool())
            .await?;

        Ok(doors)
    }

    pub async fn get_door_by_name(
        &self,
        site_id: i64,
        name: &str,
    ) -> Result<Option<Door>, DatabaseError> {
        let door = sqlx::query_as::<_, Door>("SELECT * FROM doors WHERE site_id = ? AND name = ?")
            .bind(site_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await?;

        Ok(door)
    }

    /// Timestamp of the newest event stored for a door.
    pub async fn last_event_ts(&self, door_id: i64) -> Result<Option<NaiveDateTime>, DatabaseError> {
        let newest: Option<String> =
            sqlx::query_scalar("SELECT MAX(timestamp) FROM door_events WHERE door_id = ?")
                .bind(door_id)
                .fetch_one(self.pool())
                .await?;

        newest
            .map(|ts| {
                NaiveDateTime::parse_from_str(&ts, DOOR_TS_FORMAT)
                    .map_err(|e| DatabaseError::Corrupt(format!("event timestamp {ts:?}: {e}")))
            })
            .transpose()
    }

    // =========================================================================
    // Door code queries
    // =========================================================================

    /// Create a code, or replace its holder and reinstate it if revoked.
    pub async fn upsert_code(
        &self,
        params: &CodeParams<'_>,
        now: i64,
    ) -> Result<DoorCodeRow, DatabaseError> {
        sqlx::query(
            "INSERT INTO door_codes (code, username, first_name, last_name, created_by, created_at, modified_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (code) DO UPDATE SET username = excluded.username, \
             first_name = excluded.first_name, last_name = excluded.last_name, \
             modified_at = excluded.modified_at, revoked = 0",
        )
        .bind(params.code)
        .bind(params.username)
        .bind(params.first_name)
        .bind(params.last_name)
        .bind(params.created_by)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.find_code(params.code)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Door code {}", params.code)))
    }

    /// Revoke a code. Revocation is a modification, so sites resync.
    pub async fn revoke_code(&self, code: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE door_codes SET revoked = 1, modified_at = ? WHERE code = ? AND revoked = 0",
        )
        .bind(now)
        .bind(code)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Look a code up, revoked or not.
    pub async fn find_code(&self, code: &str) -> Result<Option<DoorCodeRow>, DatabaseError> {
        let row = sqlx::query_as::<_, DoorCodeRow>("SELECT * FROM door_codes WHERE code = ?")
            .bind(code)
            .fetch_optional(self.pool())
            .await?;

        Ok(row)
    }

    /// Every code that should be on the doors, ordered by holder.
    pub async fn active_codes(&self) -> Result<Vec<DoorCodeRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, DoorCodeRow>(
            "SELECT * FROM door_codes WHERE revoked = 0 ORDER BY username, code",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Whether any code was created, changed or revoked at or after `since`.
    pub async fn codes_changed_since(&self, since: i64) -> Result<bool, DatabaseError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM door_codes WHERE modified_at >= ?")
                .bind(since)
                .fetch_one(self.pool())
                .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Door event queries
    // =========================================================================

    /// Store one event. Returns `false` when it was already stored.
    pub async fn insert_event(
        &self,
        door_id: i64,
        event: &DoorEvent,
        username: Option<&str>,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO door_events (door_id, timestamp, code, username, event_type, description, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(door_id)
        .bind(format_door_ts(&event.timestamp))
        .bind(event.code.as_deref().unwrap_or_default())
        .bind(username)
        .bind(event.event_type.code())
        .bind(&event.description)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Newest events first, optionally limited to one site.
    pub async fn recent_events(
        &self,
        site_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DoorEventRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, DoorEventRow>(
            "SELECT e.id, e.door_id, d.name AS door_name, e.timestamp, e.code, e.username, \
             e.event_type, e.description, e.received_at \
             FROM door_events e JOIN doors d ON d.id = e.door_id \
             WHERE (? IS NULL OR d.site_id = ?) \
             ORDER BY e.timestamp DESC, e.id DESC LIMIT ?",
        )
        .bind(site_id)
        .bind(site_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    // =========================================================================
    // Gatekeeper log queries
    // =========================================================================

    pub async fn insert_gatekeeper_log(
        &self,
        site_id: i64,
        message: &str,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO gatekeeper_logs (site_id, message, created_at) VALUES (?, ?, ?)")
            .bind(site_id)
            .bind(message)
            .bind(now)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn recent_gatekeeper_logs(
        &self,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<GatekeeperLog>, DatabaseError> {
        let logs = sqlx::query_as::<_, GatekeeperLog>(
            "SELECT * FROM gatekeeper_logs WHERE site_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(site_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(logs)
    }
}
