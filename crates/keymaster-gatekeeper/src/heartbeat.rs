//! The heartbeat: a cheap "anything changed?" poll against the Keymaster.
//!
//! Detection and application are decoupled. The loop only flags new data;
//! the supervisor pulls and applies the codes and then calls
//! [`HeartbeatLoop::all_clear`] with the apply receipt. While the flag is
//! set the loop does not poll again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use keymaster_core::CheckResult;

use crate::backoff::BackoffPolicy;
use crate::error::{GatekeeperError, Result};
use crate::gatekeeper::ApplyReceipt;
use crate::keymaster::KeymasterClient;

/// Delay used once `stop()` has been requested.
const STOP_DELAY: Duration = Duration::from_millis(100);

/// Heartbeat state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Polling,
    /// New data flagged; waiting for the supervisor to apply it.
    PendingApply,
    /// Applied; acknowledgement in flight.
    Applied,
    /// Acknowledged; about to return to idle.
    AckSent,
}

impl HeartbeatState {
    /// Whether the transient "new data" flag is set.
    pub const fn has_new_data(self) -> bool {
        matches!(self, Self::PendingApply | Self::Applied)
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Flag already set; nothing sent.
    Skipped,
    NoChange,
    Changed,
    /// Transport or protocol failure; retried next tick.
    Failed,
}

/// Polls `CHECK_DOOR_CODES` until stopped.
pub struct HeartbeatLoop {
    client: KeymasterClient,
    backoff: BackoffPolicy,
    state: watch::Sender<HeartbeatState>,
    running: AtomicBool,
    stopping: AtomicBool,
    failures: AtomicU32,
    wake: Notify,
}

impl HeartbeatLoop {
    pub fn new(client: KeymasterClient, poll_delay: Duration) -> Self {
        let (state, _) = watch::channel(HeartbeatState::Idle);
        Self {
            client,
            backoff: BackoffPolicy::starting_at(poll_delay),
            state,
            running: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> HeartbeatState {
        *self.state.borrow()
    }

    pub fn has_new_data(&self) -> bool {
        self.state().has_new_data()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consecutive failed polls.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Delay before the next poll.
    pub fn current_delay(&self) -> Duration {
        if self.stopping.load(Ordering::SeqCst) {
            STOP_DELAY
        } else {
            self.backoff.delay_for_attempt(self.failures())
        }
    }

    fn set_state(&self, state: HeartbeatState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Heartbeat state");
        }
    }

    /// One tick: poll unless new data is already flagged.
    pub async fn poll_once(&self) -> PollOutcome {
        if self.has_new_data() {
            return PollOutcome::Skipped;
        }
        self.set_state(HeartbeatState::Polling);
        match self.client.check_door_codes().await {
            Ok(CheckResult::NoData) => {
                self.failures.store(0, Ordering::SeqCst);
                self.set_state(HeartbeatState::Idle);
                PollOutcome::NoChange
            }
            Ok(CheckResult::NewData) => {
                self.failures.store(0, Ordering::SeqCst);
                info!("Keymaster has new door codes");
                self.set_state(HeartbeatState::PendingApply);
                PollOutcome::Changed
            }
            Err(GatekeeperError::Protocol(e)) => {
                warn!(request = "check_door_codes", error = %e, "Ignoring unexpected reply");
                self.set_state(HeartbeatState::Idle);
                PollOutcome::Failed
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(request = "check_door_codes", error = %e, failures, "Heartbeat poll failed");
                self.set_state(HeartbeatState::Idle);
                PollOutcome::Failed
            }
        }
    }

    /// Poll until [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>) {
        info!("Heartbeat loop started");
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
        info!("Heartbeat loop stopped");
    }

    /// Acknowledge an applied snapshot with `MARK_SUCCESS` and clear the flag.
    ///
    /// If the Keymaster does not answer `OK` the flag stays set, so the same
    /// snapshot is pulled and applied again.
    pub async fn all_clear(&self, receipt: ApplyReceipt) -> Result<()> {
        self.set_state(HeartbeatState::Applied);
        match self.client.mark_success().await {
            Ok(()) => {
                self.set_state(HeartbeatState::AckSent);
                info!(
                    doors = receipt.doors(),
                    changes = receipt.changes(),
                    "Keymaster acknowledged door codes"
                );
                self.set_state(HeartbeatState::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(HeartbeatState::PendingApply);
                Err(match e {
                    GatekeeperError::Desync(_) | GatekeeperError::Transport(_) => e,
                    other => GatekeeperError::Desync(other.to_string()),
                })
            }
        }
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

impl std::fmt::Debug for HeartbeatLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatLoop")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}
