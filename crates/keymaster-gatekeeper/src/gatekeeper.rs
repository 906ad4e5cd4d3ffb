//! Agent-side door state.
//!
//! The [`Gatekeeper`] owns the configured doors and their drivers. Every
//! fan-out over doors is isolated per door: one controller failing never
//! stops the others from being served.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use keymaster_core::{CodeDelivery, DoorCode, DoorEvent, DoorRecord, EventBatch};

use crate::driver::reconcile::{self, DEFAULT_PAGE_SIZE};
use crate::driver::{CredentialChange, DoorDriver, DriverError, DriverFactory};
use crate::error::{GatekeeperError, Result};

/// One configured door and its driver.
pub struct DoorHandle {
    record: DoorRecord,
    driver: Arc<dyn DoorDriver>,
    last_event_ts: Mutex<Option<NaiveDateTime>>,
}

impl DoorHandle {
    fn new(record: DoorRecord, driver: Arc<dyn DoorDriver>) -> Self {
        let last_event_ts = Mutex::new(record.last_event_ts);
        Self {
            record,
            driver,
            last_event_ts,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub const fn record(&self) -> &DoorRecord {
        &self.record
    }

    pub fn driver(&self) -> &dyn DoorDriver {
        self.driver.as_ref()
    }

    /// Timestamp of the newest event already known upstream.
    pub async fn last_event_ts(&self) -> Option<NaiveDateTime> {
        *self.last_event_ts.lock().await
    }

    async fn set_last_event_ts(&self, ts: NaiveDateTime) {
        *self.last_event_ts.lock().await = Some(ts);
    }
}

impl std::fmt::Debug for DoorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorHandle")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Proof that a code snapshot reached every configured door.
///
/// Only [`Gatekeeper::process_door_codes`] creates one, and the heartbeat's
/// acknowledgement consumes it, so `MARK_SUCCESS` cannot precede the apply.
#[derive(Debug)]
#[must_use]
pub struct ApplyReceipt {
    doors: usize,
    changes: usize,
}

impl ApplyReceipt {
    pub const fn doors(&self) -> usize {
        self.doors
    }

    pub const fn changes(&self) -> usize {
        self.changes
    }
}

/// Outcome of a clock sync pass.
#[derive(Debug, Default)]
pub struct ClockReport {
    pub synced: Vec<String>,
    pub failed: Vec<(String, DriverError)>,
}

/// Events found by a forwarding sweep, plus where each door's cursor moves
/// once they are accepted upstream.
#[derive(Debug, Default)]
pub struct EventSweep {
    pub batch: EventBatch,
    newest: BTreeMap<String, NaiveDateTime>,
}

impl EventSweep {
    pub fn event_count(&self) -> usize {
        self.batch.values().map(Vec::len).sum()
    }
}

/// Holds configured doors and applies Keymaster state to them.
pub struct Gatekeeper {
    factory: Arc<dyn DriverFactory>,
    doors: RwLock<BTreeMap<String, Arc<DoorHandle>>>,
    page_size: usize,
    magic_key: Option<String>,
}

impl Gatekeeper {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            doors: RwLock::new(BTreeMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            magic_key: None,
        }
    }

    /// Card code that toggles a door's lock when presented.
    #[must_use]
    pub fn with_magic_key(mut self, magic_key: Option<String>) -> Self {
        self.magic_key = magic_key.filter(|k| !k.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Replace the door mapping with the doors in `payload`.
    ///
    /// Returns the number of doors now configured; zero is valid and means
    /// there is nothing to manage.
    pub async fn configure_doors(&self, payload: &str) -> Result<usize> {
        if payload.trim().is_empty() {
            return Err(GatekeeperError::Configuration(
                "Empty door configuration".into(),
            ));
        }
        let records: Vec<DoorRecord> = serde_json::from_str(payload).map_err(|e| {
            GatekeeperError::Configuration(format!("Invalid door configuration: {e}"))
        })?;

        let mut names = HashSet::new();
        for record in &records {
            if !names.insert(record.name.as_str()) {
                return Err(GatekeeperError::Configuration(format!(
                    "Duplicate door name: {}",
                    record.name
                )));
            }
        }

        let mut doors = BTreeMap::new();
        for record in records {
            let driver = self
                .factory
                .create(&record)
                .map_err(|source| GatekeeperError::Driver {
                    door: record.name.clone(),
                    source,
                })?;
            info!(
                door = %record.name,
                door_type = %record.door_type,
                ip = %record.ip_address,
                "Configured door"
            );
            doors.insert(record.name.clone(), Arc::new(DoorHandle::new(record, driver)));
        }

        let count = doors.len();
        *self.doors.write().await = doors;
        Ok(count)
    }

    /// Configured doors in name order.
    pub async fn doors(&self) -> Vec<Arc<DoorHandle>> {
        self.doors.read().await.values().cloned().collect()
    }

    pub async fn door_count(&self) -> usize {
        self.doors.read().await.len()
    }

    /// Look up a configured door.
    pub async fn get_door(&self, name: &str) -> Result<Arc<DoorHandle>> {
        self.doors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatekeeperError::DoorNotFound(name.to_string()))
    }

    /// Set every door's clock to `now`. Failures are logged per door.
    pub async fn sync_clocks(&self, now: NaiveDateTime) -> ClockReport {
        let mut report = ClockReport::default();
        for door in self.doors().await {
            match door.driver().sync_clock(now).await {
                Ok(()) => report.synced.push(door.name().to_string()),
                Err(e) => {
                    warn!(door = %door.name(), error = %e, "Failed to set door clock");
                    report.failed.push((door.name().to_string(), e));
                }
            }
        }
        report
    }

    /// Apply a code delivery to every door.
    ///
    /// Each door is reconciled against the delivered codes, so re-applying
    /// the same payload changes nothing. An empty delta is a no-op, while an
    /// empty snapshot removes every credential. Succeeds only if every door
    /// succeeded.
    pub async fn process_door_codes(&self, payload: &str) -> Result<ApplyReceipt> {
        let delivery: CodeDelivery =
            serde_json::from_str(payload).map_err(keymaster_core::Error::from)?;
        let doors = self.doors().await;
        if !delivery.is_authoritative() {
            debug!("Empty code list, nothing to apply");
            return Ok(ApplyReceipt {
                doors: doors.len(),
                changes: 0,
            });
        }
        let codes = delivery.codes();

        let mut changes = 0;
        let mut failures = Vec::new();
        for door in &doors {
            match self.reconcile_door(door, codes).await {
                Ok(applied) => changes += applied,
                Err(e) => {
                    warn!(door = %door.name(), error = %e, "Failed to apply door codes");
                    failures.push((door.name().to_string(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(GatekeeperError::Apply { failures });
        }
        info!(
            codes = codes.len(),
            doors = doors.len(),
            changes,
            "Door codes applied"
        );
        Ok(ApplyReceipt {
            doors: doors.len(),
            changes,
        })
    }

    async fn reconcile_door(
        &self,
        door: &DoorHandle,
        codes: &[DoorCode],
    ) -> std::result::Result<usize, DriverError> {
        let current = reconcile::load_all_credentials(door.driver(), self.page_size).await?;
        let plan = reconcile::plan_changes(&current, codes);
        if plan.is_empty() {
            debug!(door = %door.name(), "Door codes already current");
            return Ok(0);
        }
        door.driver().apply_changes(&plan).await?;
        Ok(plan.len())
    }

    /// Remove every credential from every door.
    pub async fn clear_all_codes(&self) -> Result<usize> {
        let mut removed = 0;
        let mut failures = Vec::new();
        for door in self.doors().await {
            let result = async {
                let current =
                    reconcile::load_all_credentials(door.driver(), self.page_size).await?;
                let plan: Vec<CredentialChange> = current
                    .into_iter()
                    .map(|credential| CredentialChange::Remove { credential })
                    .collect();
                door.driver().apply_changes(&plan).await?;
                Ok::<_, DriverError>(plan.len())
            }
            .await;
            match result {
                Ok(count) => {
                    info!(door = %door.name(), removed = count, "Cleared door codes");
                    removed += count;
                }
                Err(e) => {
                    warn!(door = %door.name(), error = %e, "Failed to clear door codes");
                    failures.push((door.name().to_string(), e));
                }
            }
        }
        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(GatekeeperError::Apply { failures })
        }
    }

    /// Up to `records` recent events per door, newest first.
    ///
    /// Doors whose controller cannot be read are logged and left out.
    pub async fn pull_event_logs(&self, records: usize) -> EventBatch {
        let mut batch = EventBatch::new();
        for door in self.doors().await {
            match door.driver().pull_event_log(records).await {
                Ok(events) => {
                    batch.insert(door.name().to_string(), events);
                }
                Err(e) => {
                    warn!(door = %door.name(), error = %e, "Failed to pull event log");
                }
            }
        }
        batch
    }

    /// Events newer than each door's cursor, oldest first.
    pub async fn collect_new_events(&self, records: usize) -> EventSweep {
        let mut sweep = EventSweep::default();
        for (name, events) in self.pull_event_logs(records).await {
            let Some(newest) = DoorEvent::newest(&events).map(|e| e.timestamp) else {
                continue;
            };
            let door = match self.get_door(&name).await {
                Ok(door) => door,
                Err(_) => continue,
            };
            let cursor = door.last_event_ts().await;
            if cursor == Some(newest) {
                continue;
            }
            let mut fresh: Vec<DoorEvent> = events
                .into_iter()
                .filter(|e| cursor.is_none_or(|c| e.timestamp > c))
                .collect();
            fresh.sort_by_key(|e| e.timestamp);
            sweep.newest.insert(name.clone(), newest);
            if !fresh.is_empty() {
                sweep.batch.insert(name, fresh);
            }
        }
        sweep
    }

    /// Move door cursors past a sweep the Keymaster accepted.
    pub async fn commit_sweep(&self, sweep: &EventSweep) {
        for (name, ts) in &sweep.newest {
            if let Ok(door) = self.get_door(name).await {
                door.set_last_event_ts(*ts).await;
            }
        }
    }

    /// Toggle `door` if `event` carries the magic key. Returns whether it did.
    pub async fn apply_magic_key(&self, door: &DoorHandle, event: &DoorEvent) -> Result<bool> {
        let Some(magic_key) = &self.magic_key else {
            return Ok(false);
        };
        if event.code.as_deref() != Some(magic_key.as_str()) {
            return Ok(false);
        }
        let driver_error = |source| GatekeeperError::Driver {
            door: door.name().to_string(),
            source,
        };
        let locked = door.driver().is_locked().await.map_err(driver_error)?;
        if locked {
            door.driver().unlock().await.map_err(driver_error)?;
        } else {
            door.driver().lock().await.map_err(driver_error)?;
        }
        info!(door = %door.name(), locked = !locked, "Magic key toggled door");
        Ok(true)
    }

    /// Names of configured doors, for log context.
    pub async fn door_names(&self) -> BTreeSet<String> {
        self.doors.read().await.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("page_size", &self.page_size)
            .field("magic_key", &self.magic_key.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::DateTime;
    use keymaster_core::DoorEventType;

    use super::*;
    use crate::driver::TestDriverFactory;

    const TWO_DOORS: &str = r#"[
        {"name":"front","door_type":"test","ip_address":"127.0.0.1","username":"u","password":"p"},
        {"name":"back","door_type":"test","ip_address":"127.0.0.2","username":"u","password":"p"}
    ]"#;

    fn setup() -> (Gatekeeper, Arc<TestDriverFactory>) {
        let factory = Arc::new(TestDriverFactory::new());
        (Gatekeeper::new(factory.clone()), factory)
    }

    fn at(secs: i64) -> NaiveDateTime {
        DateTime::from_timestamp(secs, 0).unwrap().naive_utc()
    }

    fn event(secs: i64, code: Option<&str>) -> DoorEvent {
        DoorEvent {
            timestamp: at(secs),
            code: code.map(ToString::to_string),
            event_type: DoorEventType::AccessGranted,
            description: "Access Granted".into(),
            username: None,
        }
    }

    fn codes(list: &[(&str, &str)]) -> String {
        let codes: Vec<DoorCode> = list.iter().map(|(c, u)| DoorCode::new(*c, *u)).collect();
        serde_json::to_string(&codes).unwrap()
    }

    #[tokio::test]
    async fn configure_replaces_doors_wholesale() {
        let (gk, _) = setup();
        assert_eq!(gk.configure_doors(TWO_DOORS).await.unwrap(), 2);
        let one = r#"[{"name":"side","door_type":"test","ip_address":"x","username":"u","password":"p"}]"#;
        assert_eq!(gk.configure_doors(one).await.unwrap(), 1);
        assert!(gk.get_door("front").await.is_err());
        assert_eq!(gk.get_door("side").await.unwrap().name(), "side");
    }

    #[tokio::test]
    async fn empty_payload_is_configuration_error() {
        let (gk, _) = setup();
        assert!(matches!(
            gk.configure_doors("  ").await,
            Err(GatekeeperError::Configuration(_))
        ));
        assert!(matches!(
            gk.configure_doors("not json").await,
            Err(GatekeeperError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn zero_doors_is_not_an_error() {
        let (gk, _) = setup();
        assert_eq!(gk.configure_doors("[]").await.unwrap(), 0);
        assert_eq!(gk.door_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_door_names_are_rejected() {
        let (gk, _) = setup();
        let dup = r#"[
            {"name":"front","door_type":"test","ip_address":"a","username":"u","password":"p"},
            {"name":"front","door_type":"test","ip_address":"b","username":"u","password":"p"}
        ]"#;
        assert!(matches!(
            gk.configure_doors(dup).await,
            Err(GatekeeperError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn unknown_door_lookup_fails() {
        let (gk, _) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        assert!(matches!(
            gk.get_door("garage").await,
            Err(GatekeeperError::DoorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn clock_sync_failure_is_isolated() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        factory.get("back").unwrap().set_offline(true).await;

        let report = gk.sync_clocks(at(1_000)).await;
        assert_eq!(report.synced, vec!["front".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(factory.get("front").unwrap().clock().await, Some(at(1_000)));
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let payload = codes(&[("111", "alice"), ("222", "bob")]);

        let first = gk.process_door_codes(&payload).await.unwrap();
        assert_eq!(first.changes(), 4);
        let front = factory.get("front").unwrap();
        let state = front.credentials().await;

        let second = gk.process_door_codes(&payload).await.unwrap();
        assert_eq!(second.changes(), 0);
        assert_eq!(front.credentials().await, state);
        assert_eq!(front.changes_applied().await, 2);
    }

    #[tokio::test]
    async fn empty_code_list_changes_nothing() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let _ = gk.process_door_codes(&codes(&[("111", "alice")])).await.unwrap();
        let receipt = gk.process_door_codes("[]").await.unwrap();
        assert_eq!(receipt.changes(), 0);
        assert_eq!(factory.get("back").unwrap().codes().await, vec!["111"]);
    }

    #[tokio::test]
    async fn empty_snapshot_removes_last_code() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let _ = gk.process_door_codes(&codes(&[("111", "alice")])).await.unwrap();

        let receipt = gk.process_door_codes(r#"{"snapshot":[]}"#).await.unwrap();
        assert_eq!(receipt.doors(), 2);
        assert_eq!(receipt.changes(), 2);
        assert!(factory.get("front").unwrap().codes().await.is_empty());
        assert!(factory.get("back").unwrap().codes().await.is_empty());
    }

    #[tokio::test]
    async fn one_failing_door_fails_the_apply() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        factory.get("back").unwrap().set_fail_apply(true).await;

        let err = gk
            .process_door_codes(&codes(&[("111", "alice")]))
            .await
            .unwrap_err();
        let GatekeeperError::Apply { failures } = err else {
            unreachable!("apply error expected");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "back");
        // The healthy door still received the code.
        assert_eq!(factory.get("front").unwrap().codes().await, vec!["111"]);
    }

    #[tokio::test]
    async fn malformed_code_payload_is_protocol_error() {
        let (gk, _) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        assert!(matches!(
            gk.process_door_codes("new_data").await,
            Err(GatekeeperError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn clear_all_removes_everything() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let _ = gk.process_door_codes(&codes(&[("111", "alice"), ("222", "bob")]))
            .await
            .unwrap();
        assert_eq!(gk.clear_all_codes().await.unwrap(), 4);
        assert!(factory.get("front").unwrap().codes().await.is_empty());
    }

    #[tokio::test]
    async fn event_pull_omits_unreachable_doors() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        factory.get("front").unwrap().push_event(event(100, None)).await;
        factory.get("back").unwrap().set_offline(true).await;

        let batch = gk.pull_event_logs(1).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch["front"][0].timestamp, at(100));
    }

    #[tokio::test]
    async fn sweep_forwards_only_new_events_and_commits_cursor() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let front = factory.get("front").unwrap();
        front.push_event(event(100, None)).await;
        front.push_event(event(200, None)).await;

        let sweep = gk.collect_new_events(10).await;
        assert_eq!(sweep.event_count(), 2);
        assert_eq!(sweep.batch["front"][0].timestamp, at(100));
        gk.commit_sweep(&sweep).await;
        assert_eq!(gk.get_door("front").await.unwrap().last_event_ts().await, Some(at(200)));

        front.push_event(event(300, None)).await;
        let sweep = gk.collect_new_events(10).await;
        assert_eq!(sweep.event_count(), 1);
        assert_eq!(sweep.batch["front"][0].timestamp, at(300));
    }

    #[tokio::test]
    async fn uncommitted_sweep_is_resent() {
        let (gk, factory) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        factory.get("back").unwrap().push_event(event(100, None)).await;

        assert_eq!(gk.collect_new_events(10).await.event_count(), 1);
        assert_eq!(gk.collect_new_events(10).await.event_count(), 1);
    }

    #[tokio::test]
    async fn magic_key_toggles_lock() {
        let factory = Arc::new(TestDriverFactory::new());
        let gk = Gatekeeper::new(factory.clone()).with_magic_key(Some("FFFF".into()));
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let door = gk.get_door("front").await.unwrap();

        assert!(!gk.apply_magic_key(&door, &event(1, Some("1234"))).await.unwrap());
        assert!(gk.apply_magic_key(&door, &event(2, Some("FFFF"))).await.unwrap());
        assert!(!factory.get("front").unwrap().is_locked().await.unwrap());
        assert!(gk.apply_magic_key(&door, &event(3, Some("FFFF"))).await.unwrap());
        assert!(factory.get("front").unwrap().is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn no_magic_key_configured() {
        let (gk, _) = setup();
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let door = gk.get_door("front").await.unwrap();
        assert!(!gk.apply_magic_key(&door, &event(1, Some(""))).await.unwrap());
    }

    #[tokio::test]
    async fn small_pages_still_see_every_credential() {
        let factory = Arc::new(TestDriverFactory::new());
        let gk = Gatekeeper::new(factory.clone()).with_page_size(1);
        gk.configure_doors(TWO_DOORS).await.unwrap();
        let all = codes(&[("1", "ada"), ("2", "bob"), ("3", "cy")]);
        let _ = gk.process_door_codes(&all).await.unwrap();

        let receipt = gk.process_door_codes(&all).await.unwrap();
        assert_eq!(receipt.changes(), 0);
        assert_eq!(factory.get("front").unwrap().codes().await, vec!["1", "2", "3"]);
    }
}
