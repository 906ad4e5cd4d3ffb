//! Watches the doors' own event logs for new activity.
//!
//! The watcher only detects: it compares each door's newest event with the
//! door's cursor and flags the first door that differs. Forwarding the
//! events upstream is the supervisor's job, which then calls
//! [`EventWatcher::all_clear`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use keymaster_core::DoorEvent;

use crate::gatekeeper::Gatekeeper;

const STOP_DELAY: Duration = Duration::from_millis(100);

/// Events pulled per door when probing for changes.
const PROBE_RECORDS: usize = 1;

/// Polls door event logs until stopped.
pub struct EventWatcher {
    gatekeeper: Arc<Gatekeeper>,
    delay: Duration,
    /// Door whose new event set the flag; `Some` means flagged.
    trigger: watch::Sender<Option<String>>,
    running: AtomicBool,
    stopping: AtomicBool,
    wake: Notify,
}

impl EventWatcher {
    pub fn new(gatekeeper: Arc<Gatekeeper>, delay: Duration) -> Self {
        let (trigger, _) = watch::channel(None);
        Self {
            gatekeeper,
            delay,
            trigger,
            running: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn has_new_data(&self) -> bool {
        self.trigger.borrow().is_some()
    }

    /// Door that triggered the current flag.
    pub fn trigger(&self) -> Option<String> {
        self.trigger.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.trigger.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn current_delay(&self) -> Duration {
        if self.stopping.load(Ordering::SeqCst) {
            STOP_DELAY
        } else {
            self.delay
        }
    }

    /// One tick. Returns the door that triggered a new flag, if any.
    pub async fn poll_once(&self) -> Option<String> {
        if self.has_new_data() {
            return None;
        }
        let batch = self.gatekeeper.pull_event_logs(PROBE_RECORDS).await;
        for door in self.gatekeeper.doors().await {
            let Some(newest) = batch.get(door.name()).and_then(|e| DoorEvent::newest(e)) else {
                continue;
            };
            if door.last_event_ts().await == Some(newest.timestamp) {
                continue;
            }

            info!(
                door = %door.name(),
                event = %newest.description,
                timestamp = %newest.timestamp,
                "New door activity"
            );
            if let Err(e) = self.gatekeeper.apply_magic_key(&door, newest).await {
                warn!(door = %door.name(), error = %e, "Magic key toggle failed");
            }
            let name = door.name().to_string();
            self.trigger.send_replace(Some(name.clone()));
            return Some(name);
        }
        debug!("No new door activity");
        None
    }

    /// Poll until [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>) {
        info!("Event watcher started");
        while self.is_running() {
            self.poll_once().await;
            if !self.is_running() {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(self.current_delay()) => {}
                () = self.wake.notified() => {}
            }
        }
        info!("Event watcher stopped");
    }

    /// Clear the flag. The caller must already have forwarded the events.
    pub fn all_clear(&self) {
        self.trigger.send_replace(None);
    }

    /// Re-arm a stopped loop so it can be run again.
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    /// Request cooperative termination; observed at the next iteration.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for EventWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWatcher")
            .field("delay", &self.delay)
            .field("trigger", &self.trigger())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
