//! Storage layer tests for the Keymaster server.

#![allow(clippy::unwrap_used)]

use chrono::DateTime;

use keymaster_core::{DoorEvent, DoorEventType, DoorType};

use super::db::KeymasterDatabase;
use super::models::CodeParams;

async fn test_db() -> KeymasterDatabase {
    KeymasterDatabase::open_in_memory().await.unwrap()
}

fn code<'a>(code: &'a str, username: &'a str) -> CodeParams<'a> {
    CodeParams {
        code,
        username,
        ..CodeParams::default()
    }
}

fn event(secs: i64, code: Option<&str>) -> DoorEvent {
    DoorEvent {
        timestamp: DateTime::from_timestamp(secs, 0).unwrap().naive_utc(),
        code: code.map(ToString::to_string),
        event_type: DoorEventType::AccessGranted,
        description: "Access Granted".into(),
        username: None,
    }
}

// === Site tests ===

#[tokio::test]
async fn create_and_find_site_by_ip() {
    let db = test_db().await;
    let site = db
        .create_site("Main", "10.0.0.9", "key", true, 1_000)
        .await
        .unwrap();

    assert_eq!(site.gatekeeper_ip, "10.0.0.9");
    assert!(site.is_enabled);
    assert!(!site.is_syncing);
    assert!(site.sync_at.is_none());

    let found = db.get_site_by_ip("10.0.0.9").await.unwrap().unwrap();
    assert_eq!(found.id, site.id);
    assert!(db.get_site_by_ip("10.0.0.10").await.unwrap().is_none());
    assert!(db.require_site_by_ip("10.0.0.10").await.is_err());
}

#[tokio::test]
async fn duplicate_site_ip_is_rejected() {
    let db = test_db().await;
    db.create_site("Main", "10.0.0.9", "k", true, 1).await.unwrap();
    assert!(db.create_site("Other", "10.0.0.9", "k", true, 2).await.is_err());
}

#[tokio::test]
async fn site_key_and_enable_flag_update() {
    let db = test_db().await;
    let site = db.create_site("New", "10.0.0.9", "", false, 1).await.unwrap();

    assert!(db.set_site_key(site.id, "secret").await.unwrap());
    assert!(db.set_site_enabled(site.id, true).await.unwrap());
    db.touch_site(site.id, 42).await.unwrap();

    let site = db.get_site(site.id).await.unwrap();
    assert_eq!(site.encryption_key, "secret");
    assert!(site.is_enabled);
    assert_eq!(site.access_at, Some(42));
    assert!(!format!("{site:?}").contains("secret"));
}

#[tokio::test]
async fn mark_success_commits_pending_sync() {
    let db = test_db().await;
    let site = db.create_site("Main", "10.0.0.9", "k", true, 1).await.unwrap();

    db.begin_sync(site.id, 100).await.unwrap();
    let pending = db.get_site(site.id).await.unwrap();
    assert!(pending.is_syncing);
    assert_eq!(pending.pending_sync_at, Some(100));
    assert!(pending.sync_at.is_none());

    let site = db.mark_success(site.id, 150).await.unwrap();
    assert_eq!(site.sync_at, Some(100));
    assert_eq!(site.success_at, Some(150));
    assert!(!site.is_syncing);
    assert!(site.pending_sync_at.is_none());
}

#[tokio::test]
async fn mark_success_without_pending_sync_keeps_sync_at() {
    let db = test_db().await;
    let site = db.create_site("Main", "10.0.0.9", "k", true, 1).await.unwrap();
    db.begin_sync(site.id, 100).await.unwrap();
    db.mark_success(site.id, 150).await.unwrap();

    let site = db.mark_success(site.id, 300).await.unwrap();
    assert_eq!(site.sync_at, Some(100));
    assert_eq!(site.success_at, Some(300));
}

#[tokio::test]
async fn force_sync_clears_sync_at() {
    let db = test_db().await;
    let site = db.create_site("Main", "10.0.0.9", "k", true, 1).await.unwrap();
    db.begin_sync(site.id, 100).await.unwrap();
    db.mark_success(site.id, 150).await.unwrap();

    assert!(db.force_sync(site.id).await.unwrap());
    assert!(db.get_site(site.id).await.unwrap().sync_at.is_none());
}

// === Door tests ===

#[tokio::test]
async fn doors_are_scoped_to_their_site() {
    let db = test_db().await;
    let a = db.create_site("A", "10.0.0.1", "k", true, 1).await.unwrap();
    let b = db.create_site("B", "10.0.0.2", "k", true, 1).await.unwrap();
    db.create_door(a.id, "front", "hid", "192.168.1.5", "admin", "pw")
        .await
        .unwrap();
    db.create_door(b.id, "front", "test", "192.168.2.5", "admin", "pw")
        .await
        .unwrap();

    let doors = db.list_doors(a.id).await.unwrap();
    assert_eq!(doors.len(), 1);
    let record = doors[0].to_record(None).unwrap();
    assert_eq!(record.door_type, DoorType::Hid);
    assert_eq!(record.ip_address, "192.168.1.5");

    assert!(db.get_door_by_name(b.id, "front").await.unwrap().is_some());
    assert!(db.get_door_by_name(b.id, "back").await.unwrap().is_none());
    assert!(
        db.create_door(a.id, "front", "hid", "x", "u", "p")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unknown_door_type_is_corrupt() {
    let db = test_db().await;
    let site = db.create_site("A", "10.0.0.1", "k", true, 1).await.unwrap();
    let door = db
        .create_door(site.id, "front", "maypi", "x", "u", "p")
        .await
        .unwrap();
    assert!(door.to_record(None).is_err());
}

// === Door code tests ===

#[tokio::test]
async fn upsert_replaces_holder_and_reinstates() {
    let db = test_db().await;
    db.upsert_code(&code("0042", "ada"), 10).await.unwrap();
    assert!(db.revoke_code("0042", 20).await.unwrap());
    assert!(db.active_codes().await.unwrap().is_empty());

    let row = db.upsert_code(&code("0042", "grace"), 30).await.unwrap();
    assert_eq!(row.username, "grace");
    assert!(!row.revoked);
    assert_eq!(row.created_at, 10);
    assert_eq!(row.modified_at, 30);
}

#[tokio::test]
async fn revoke_twice_reports_nothing_to_do() {
    let db = test_db().await;
    db.upsert_code(&code("0042", "ada"), 10).await.unwrap();
    assert!(db.revoke_code("0042", 20).await.unwrap());
    assert!(!db.revoke_code("0042", 30).await.unwrap());
    assert!(!db.revoke_code("9999", 30).await.unwrap());

    let row = db.find_code("0042").await.unwrap().unwrap();
    assert!(row.revoked);
    assert_eq!(row.modified_at, 20);
}

#[tokio::test]
async fn active_codes_are_ordered_by_holder() {
    let db = test_db().await;
    db.upsert_code(&code("3", "carol"), 1).await.unwrap();
    db.upsert_code(&code("1", "alice"), 1).await.unwrap();
    db.upsert_code(&code("2", "bob"), 1).await.unwrap();

    let usernames: Vec<_> = db
        .active_codes()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.username)
        .collect();
    assert_eq!(usernames, vec!["alice", "bob", "carol"]);
}

#[tokio::test]
async fn change_detection_is_inclusive() {
    let db = test_db().await;
    db.upsert_code(&code("0042", "ada"), 100).await.unwrap();

    assert!(db.codes_changed_since(99).await.unwrap());
    assert!(db.codes_changed_since(100).await.unwrap());
    assert!(!db.codes_changed_since(101).await.unwrap());

    db.revoke_code("0042", 200).await.unwrap();
    assert!(db.codes_changed_since(101).await.unwrap());
}

#[tokio::test]
async fn door_code_carries_modification_time() {
    let db = test_db().await;
    let row = db
        .upsert_code(
            &CodeParams {
                code: "0042",
                username: "ada",
                first_name: Some("Ada"),
                last_name: Some("Lovelace"),
                created_by: Some("admin"),
            },
            1_700_000_000_000,
        )
        .await
        .unwrap();

    let wire = row.to_door_code();
    assert_eq!(wire.display_name(), "Ada Lovelace");
    assert_eq!(wire.created_by.as_deref(), Some("admin"));
    assert_eq!(wire.modified_at.unwrap().timestamp(), 1_700_000_000);
}

// === Door event tests ===

#[tokio::test]
async fn duplicate_events_are_ignored() {
    let db = test_db().await;
    let site = db.create_site("A", "10.0.0.1", "k", true, 1).await.unwrap();
    let door = db
        .create_door(site.id, "front", "test", "x", "u", "p")
        .await
        .unwrap();

    assert!(db.insert_event(door.id, &event(100, Some("0042")), Some("ada"), 1).await.unwrap());
    assert!(!db.insert_event(door.id, &event(100, Some("0042")), Some("ada"), 2).await.unwrap());
    // No code is still a value for uniqueness.
    assert!(db.insert_event(door.id, &event(100, None), None, 3).await.unwrap());
    assert!(!db.insert_event(door.id, &event(100, None), None, 4).await.unwrap());

    let events = db.recent_events(Some(site.id), 10).await.unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn last_event_ts_tracks_newest_event() {
    let db = test_db().await;
    let site = db.create_site("A", "10.0.0.1", "k", true, 1).await.unwrap();
    let door = db
        .create_door(site.id, "front", "test", "x", "u", "p")
        .await
        .unwrap();
    assert!(db.last_event_ts(door.id).await.unwrap().is_none());

    db.insert_event(door.id, &event(300, None), None, 1).await.unwrap();
    db.insert_event(door.id, &event(200, None), None, 1).await.unwrap();

    let newest = db.last_event_ts(door.id).await.unwrap().unwrap();
    assert_eq!(newest, event(300, None).timestamp);
}

#[tokio::test]
async fn recent_events_filter_by_site() {
    let db = test_db().await;
    let a = db.create_site("A", "10.0.0.1", "k", true, 1).await.unwrap();
    let b = db.create_site("B", "10.0.0.2", "k", true, 1).await.unwrap();
    let door_a = db.create_door(a.id, "front", "test", "x", "u", "p").await.unwrap();
    let door_b = db.create_door(b.id, "back", "test", "x", "u", "p").await.unwrap();
    db.insert_event(door_a.id, &event(100, Some("1")), None, 1).await.unwrap();
    db.insert_event(door_b.id, &event(200, Some("2")), None, 1).await.unwrap();

    let only_a = db.recent_events(Some(a.id), 10).await.unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].door_name, "front");
    assert_eq!(only_a[0].code(), Some("1"));
    assert_eq!(only_a[0].event_type(), DoorEventType::AccessGranted);

    let all = db.recent_events(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].door_name, "back");
    assert_eq!(all[0].timestamp(), Some(event(200, None).timestamp));
}

// === Gatekeeper log tests ===

#[tokio::test]
async fn gatekeeper_logs_newest_first() {
    let db = test_db().await;
    let site = db.create_site("A", "10.0.0.1", "k", true, 1).await.unwrap();
    db.insert_gatekeeper_log(site.id, "door B offline", 10).await.unwrap();
    db.insert_gatekeeper_log(site.id, "door B back", 20).await.unwrap();

    let logs = db.recent_gatekeeper_logs(site.id, 1).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "door B back");
}
