//! Keymaster Server
//!
//! Central door code store and the encrypted endpoint every site's Gatekeeper
//! polls, plus the administrative commands that manage sites, doors and codes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use keymaster_core::DoorType;
use keymaster_core::time::unix_millis;
use keymaster_server::http::{self, AppState};
use keymaster_server::storage::{CodeParams, KeymasterDatabase};
use keymaster_server::KeymasterService;

#[derive(Parser, Debug)]
#[command(name = "keymaster-server")]
#[command(version, about = "Keymaster server - door codes and Gatekeeper endpoint")]
struct Args {
    /// Path to SQLite database file.
    #[arg(long, env = "KEYMASTER_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "KEYMASTER_LOG_LEVEL", global = true)]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KEYMASTER_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Gatekeeper endpoint.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:8080", env = "KEYMASTER_LISTEN_ADDR")]
        addr: SocketAddr,

        /// Maximum age of an encrypted message, in seconds.
        #[arg(long, default_value_t = 600)]
        message_ttl: u64,
    },

    /// Print a new site encryption key.
    GenerateKey,

    /// List registered sites.
    Sites,

    /// Register a site for a Gatekeeper IP.
    AddSite {
        /// IP the site's Gatekeeper calls in from.
        #[arg(long)]
        ip: String,

        #[arg(long, default_value = "Keymaster")]
        description: String,

        /// Encryption key; a new one is generated when omitted.
        #[arg(long)]
        key: Option<String>,

        /// Leave the site disabled.
        #[arg(long)]
        disabled: bool,
    },

    /// Enable (or disable) a site, optionally setting its key.
    EnableSite {
        #[arg(long)]
        ip: String,

        #[arg(long)]
        key: Option<String>,

        /// Disable instead of enable.
        #[arg(long)]
        disable: bool,
    },

    /// Add a door to a site.
    AddDoor {
        /// Gatekeeper IP of the site.
        #[arg(long)]
        site_ip: String,

        #[arg(long)]
        name: String,

        /// Controller type ("hid" or "test").
        #[arg(long, default_value = "hid")]
        door_type: DoorType,

        /// Controller address.
        #[arg(long)]
        door_ip: String,

        #[arg(long)]
        username: String,

        #[arg(long, env = "KEYMASTER_DOOR_PASSWORD")]
        password: String,
    },

    /// Create or reassign a door code.
    SetCode {
        #[arg(long)]
        code: String,

        #[arg(long)]
        username: String,

        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,

        #[arg(long)]
        created_by: Option<String>,
    },

    /// Revoke a door code on every door.
    RevokeCode {
        #[arg(long)]
        code: String,
    },

    /// Make a site's next check report new data.
    ForceSync {
        #[arg(long)]
        ip: String,
    },

    /// Show recent door events and Gatekeeper reports.
    Events {
        /// Only events of this site.
        #[arg(long)]
        site_ip: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    keymaster_core::tracing_init::init_tracing(&args.log_level, args.log_json);

    if matches!(args.command, Command::GenerateKey) {
        print_line(&keymaster_crypto::generate_key());
        return Ok(());
    }

    let db_path = match args.db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    let db = KeymasterDatabase::open(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    match args.command {
        Command::Serve { addr, message_ttl } => serve(db, addr, message_ttl).await,
        Command::GenerateKey => Ok(()),
        Command::Sites => {
            for site in db.list_sites().await? {
                print_line(&format!(
                    "{}\t{}\t{}\tenabled={}\tsyncing={}\tsync_at={:?}\taccess_at={:?}",
                    site.id,
                    site.gatekeeper_ip,
                    site.description,
                    site.is_enabled,
                    site.is_syncing,
                    site.sync_at,
                    site.access_at,
                ));
            }
            Ok(())
        }
        Command::AddSite {
            ip,
            description,
            key,
            disabled,
        } => {
            let key = key.unwrap_or_else(keymaster_crypto::generate_key);
            keymaster_crypto::SecretKey::parse(&key).context("Invalid encryption key")?;
            let site = db
                .create_site(&description, &ip, &key, !disabled, unix_millis())
                .await?;
            info!(site = site.id, ip = %ip, "Site added");
            print_line(&key);
            Ok(())
        }
        Command::EnableSite { ip, key, disable } => {
            let site = db.require_site_by_ip(&ip).await?;
            if let Some(key) = key {
                keymaster_crypto::SecretKey::parse(&key).context("Invalid encryption key")?;
                db.set_site_key(site.id, &key).await?;
            }
            db.set_site_enabled(site.id, !disable).await?;
            info!(site = site.id, ip = %ip, enabled = !disable, "Site updated");
            Ok(())
        }
        Command::AddDoor {
            site_ip,
            name,
            door_type,
            door_ip,
            username,
            password,
        } => {
            let site = db.require_site_by_ip(&site_ip).await?;
            let door = db
                .create_door(
                    site.id,
                    &name,
                    door_type.as_str(),
                    &door_ip,
                    &username,
                    &password,
                )
                .await?;
            info!(site = site.id, door = %door.name, "Door added");
            Ok(())
        }
        Command::SetCode {
            code,
            username,
            first_name,
            last_name,
            created_by,
        } => {
            let row = db
                .upsert_code(
                    &CodeParams {
                        code: &code,
                        username: &username,
                        first_name: first_name.as_deref(),
                        last_name: last_name.as_deref(),
                        created_by: created_by.as_deref(),
                    },
                    unix_millis(),
                )
                .await?;
            info!(code = %row.code, username = %row.username, "Door code set");
            Ok(())
        }
        Command::RevokeCode { code } => {
            if !db.revoke_code(&code, unix_millis()).await? {
                anyhow::bail!("No active door code {code}");
            }
            info!(code = %code, "Door code revoked");
            Ok(())
        }
        Command::ForceSync { ip } => {
            let site = db.require_site_by_ip(&ip).await?;
            db.force_sync(site.id).await?;
            info!(site = site.id, "Forced sync on next check");
            Ok(())
        }
        Command::Events { site_ip, limit } => {
            let site = match site_ip {
                Some(ip) => Some(db.require_site_by_ip(&ip).await?),
                None => None,
            };
            for event in db.recent_events(site.as_ref().map(|s| s.id), limit).await? {
                print_line(&format!(
                    "{}\t{}\t{}\t{}\t{}",
                    event.timestamp,
                    event.door_name,
                    event.code().unwrap_or("-"),
                    event.username.as_deref().unwrap_or("-"),
                    event.description,
                ));
            }
            if let Some(site) = site {
                for log in db.recent_gatekeeper_logs(site.id, limit).await? {
                    print_line(&format!("report\t{}\t{}", log.created_at, log.message));
                }
            }
            Ok(())
        }
    }
}

async fn serve(db: KeymasterDatabase, addr: SocketAddr, message_ttl: u64) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        "Starting keymaster-server"
    );

    let service = KeymasterService::new(db, Duration::from_secs(message_ttl));
    let router = http::build_router(AppState {
        service: Arc::new(service),
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    http::serve(listener, router, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
    })
    .await?;

    info!("Keymaster stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".keymaster").join("keymaster.db"))
}
