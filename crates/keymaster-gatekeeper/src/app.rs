//! Agent supervisor: boot sequence, loop tasks and the processing phase.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use keymaster_core::GatekeeperConfig;
use keymaster_core::time::local_now;

use crate::channel::{EncryptedChannel, KeymasterLink};
use crate::driver::{DriverFactory, StandardDriverFactory};
use crate::error::Result;
use crate::gatekeeper::Gatekeeper;
use crate::heartbeat::HeartbeatLoop;
use crate::keymaster::KeymasterClient;
use crate::watcher::EventWatcher;

/// Pause before a loop task that ended unexpectedly is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// One-off steps run before the loops start.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootOptions {
    /// Pull the full code set with `FORCE_SYNC`, apply and acknowledge it.
    pub force_sync: bool,
    /// Set every door's clock.
    pub sync_clocks: bool,
    /// Remove every credential from every door first.
    pub clear_all: bool,
}

/// A running Gatekeeper agent.
pub struct GatekeeperApp {
    client: KeymasterClient,
    gatekeeper: Arc<Gatekeeper>,
    heartbeat: Arc<HeartbeatLoop>,
    watcher: Arc<EventWatcher>,
    retry_delay: Duration,
    event_sync_count: usize,
}

impl GatekeeperApp {
    /// Build the agent from its configuration with the production drivers.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        let channel = EncryptedChannel::from_config(config)?;
        Ok(Self::new(
            config,
            Arc::new(channel),
            Arc::new(StandardDriverFactory),
        ))
    }

    /// Build the agent over any link and driver factory.
    pub fn new(
        config: &GatekeeperConfig,
        link: Arc<dyn KeymasterLink>,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        let client = KeymasterClient::new(link);
        let gatekeeper =
            Arc::new(Gatekeeper::new(factory).with_magic_key(config.magic_key.clone()));
        let heartbeat = Arc::new(HeartbeatLoop::new(client.clone(), config.poll_delay()));
        let watcher = Arc::new(EventWatcher::new(
            gatekeeper.clone(),
            config.event_poll_delay(),
        ));
        Self {
            client,
            gatekeeper,
            heartbeat,
            watcher,
            retry_delay: config.poll_delay(),
            event_sync_count: config.event_sync_count,
        }
    }

    pub fn gatekeeper(&self) -> &Arc<Gatekeeper> {
        &self.gatekeeper
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatLoop> {
        &self.heartbeat
    }

    pub fn watcher(&self) -> &Arc<EventWatcher> {
        &self.watcher
    }

    /// Handshake, pull configuration and run the requested one-off steps.
    ///
    /// Returns the number of configured doors. Zero means there is nothing
    /// to manage and the caller should exit.
    pub async fn boot(&self, options: BootOptions) -> Result<usize> {
        self.client.handshake().await?;
        info!("Keymaster handshake succeeded");

        let payload = self.client.pull_configuration().await?;
        let doors = self.gatekeeper.configure_doors(&payload).await?;
        if doors == 0 {
            return Ok(0);
        }
        info!(
            doors,
            names = ?self.gatekeeper.door_names().await,
            "Door configuration loaded"
        );

        if options.sync_clocks {
            let report = self.gatekeeper.sync_clocks(local_now()).await;
            info!(
                synced = report.synced.len(),
                failed = report.failed.len(),
                "Door clocks synced"
            );
        }
        if options.clear_all {
            let removed = self.gatekeeper.clear_all_codes().await?;
            info!(removed, "Cleared all door codes");
        }
        if options.force_sync {
            let payload = self.client.pull_door_codes(true).await?;
            let receipt = self.gatekeeper.process_door_codes(&payload).await?;
            self.heartbeat.all_clear(receipt).await?;
            info!("Initial sync complete");
        }
        Ok(doors)
    }

    /// Pull the flagged code delta, apply it everywhere, then acknowledge.
    pub async fn process_codes(&self) -> Result<()> {
        let payload = self.client.pull_door_codes(false).await?;
        let receipt = self.gatekeeper.process_door_codes(&payload).await?;
        self.heartbeat.all_clear(receipt).await
    }

    /// Forward events newer than each door's cursor, then clear the flag.
    pub async fn forward_events(&self) -> Result<()> {
        let sweep = self
            .gatekeeper
            .collect_new_events(self.event_sync_count)
            .await;
        if !sweep.batch.is_empty() {
            self.client.push_event_logs(&sweep.batch).await?;
            info!(events = sweep.event_count(), "Forwarded door events");
        }
        self.gatekeeper.commit_sweep(&sweep).await;
        self.watcher.all_clear();
        Ok(())
    }

    /// Report a processing failure upstream. Best effort.
    async fn report_failure(&self, context: &str, e: &crate::error::GatekeeperError) {
        error!(error = %e, "{context}");
        let text = format!("{context}: {e}");
        if let Err(report_err) = self.client.push_gatekeeper_log(&text).await {
            warn!(error = %report_err, "Could not report failure to Keymaster");
        }
    }

    /// Run both loops and the processing phase until `shutdown` fires.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.heartbeat.resume();
        self.watcher.resume();
        let mut heartbeat_task = spawn_heartbeat(&self.heartbeat);
        let mut watcher_task = spawn_watcher(&self.watcher);
        let mut codes_rx = self.heartbeat.subscribe();
        let mut events_rx = self.watcher.subscribe();
        let mut heartbeat_joined = false;
        let mut watcher_joined = false;
        info!("Gatekeeper running");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let failed = tokio::select! {
                _ = shutdown.changed() => break,
                flagged = async { codes_rx.wait_for(|s| s.has_new_data()).await.map(|_| ()) } => {
                    if flagged.is_err() {
                        break;
                    }
                    match self.process_codes().await {
                        Ok(()) => false,
                        Err(e) => {
                            self.report_failure("Failed to process door codes", &e).await;
                            true
                        }
                    }
                }
                flagged = async { events_rx.wait_for(Option::is_some).await.map(|_| ()) } => {
                    if flagged.is_err() {
                        break;
                    }
                    match self.forward_events().await {
                        Ok(()) => false,
                        Err(e) => {
                            self.report_failure("Failed to forward door events", &e).await;
                            true
                        }
                    }
                }
                result = &mut heartbeat_task => {
                    if !self.heartbeat.is_running() {
                        heartbeat_joined = true;
                        loop_exited_cleanly("heartbeat", result);
                        break;
                    }
                    warn!(result = ?result.err(), "Heartbeat loop ended, restarting");
                    tokio::time::sleep(RESTART_DELAY).await;
                    heartbeat_task = spawn_heartbeat(&self.heartbeat);
                    false
                }
                result = &mut watcher_task => {
                    if !self.watcher.is_running() {
                        watcher_joined = true;
                        loop_exited_cleanly("watcher", result);
                        break;
                    }
                    warn!(result = ?result.err(), "Event watcher ended, restarting");
                    tokio::time::sleep(RESTART_DELAY).await;
                    watcher_task = spawn_watcher(&self.watcher);
                    false
                }
            };

            // Leave the flag set and retry on the next tick, not immediately.
            if failed {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        info!("Stopping Gatekeeper loops");
        self.heartbeat.stop();
        self.watcher.stop();
        // A handle already polled to completion by the select must not be awaited again.
        if !heartbeat_joined {
            join_loop("heartbeat", heartbeat_task).await;
        }
        if !watcher_joined {
            join_loop("watcher", watcher_task).await;
        }
        info!("Gatekeeper stopped");
        Ok(())
    }
}

fn spawn_heartbeat(heartbeat: &Arc<HeartbeatLoop>) -> JoinHandle<()> {
    tokio::spawn(Arc::clone(heartbeat).run())
}

fn spawn_watcher(watcher: &Arc<EventWatcher>) -> JoinHandle<()> {
    tokio::spawn(Arc::clone(watcher).run())
}

/// Wait for a stopped loop task; a panic is logged rather than dropped.
async fn join_loop(name: &'static str, task: JoinHandle<()>) -> bool {
    loop_exited_cleanly(name, task.await)
}

fn loop_exited_cleanly(name: &'static str, result: std::result::Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(task = name, error = %e, "Loop task failed");
            false
        }
    }
}

impl std::fmt::Debug for GatekeeperApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatekeeperApp")
            .field("heartbeat", &self.heartbeat)
            .field("watcher", &self.watcher)
            .finish_non_exhaustive()
    }
}
