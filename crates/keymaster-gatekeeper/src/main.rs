//! Keymaster Gatekeeper
//!
//! Per-site agent: polls the Keymaster for door-code changes, applies them to
//! the site's door controllers and forwards door events upstream.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use keymaster_core::config::load_config;
use keymaster_gatekeeper::{BootOptions, GatekeeperApp};

#[derive(Parser, Debug)]
#[command(name = "keymaster-gatekeeper")]
#[command(version, about = "Keymaster Gatekeeper - door controller sync agent")]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, default_value = "gatekeeper.json", env = "GATEKEEPER_CONFIG")]
    config: PathBuf,

    /// Keymaster endpoint, overrides the config file
    #[arg(long, env = "KEYMASTER_URL")]
    keymaster_url: Option<String>,

    /// Pull and apply the full code set before starting the loops
    #[arg(long)]
    sync: bool,

    /// Set the door clocks at startup even if disabled in the config
    #[arg(long)]
    set_time: bool,

    /// Remove every credential from every door at startup
    #[arg(long)]
    clear_all: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "GATEKEEPER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "GATEKEEPER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    keymaster_core::tracing_init::init_tracing(&args.log_level, args.log_json);

    let config_path = args.config.exists().then_some(args.config.as_path());
    let mut config = load_config(config_path)?;
    if let Some(url) = args.keymaster_url {
        config.keymaster_url = url;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        keymaster = %config.keymaster_url,
        "Starting keymaster-gatekeeper"
    );

    let app = GatekeeperApp::from_config(&config)?;
    let options = BootOptions {
        force_sync: args.sync,
        sync_clocks: args.set_time || config.sync_clocks,
        clear_all: args.clear_all,
    };
    let doors = app.boot(options).await.inspect_err(|e| {
        error!(error = %e, "Gatekeeper failed to start");
    })?;
    if doors == 0 {
        error!("No doors configured for this site");
        anyhow::bail!("no doors to manage");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    // Notify systemd that the agent is ready (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let serve = app.serve(shutdown_rx);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result?;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    serve.await?;
    info!("Gatekeeper exited");
    Ok(())
}
