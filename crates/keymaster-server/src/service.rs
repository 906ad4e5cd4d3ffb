//! Answers Gatekeeper requests for the site they come from.
//!
//! A site is identified by the IP its Gatekeeper calls in from, and each site
//! has its own encryption key. Sync bookkeeping follows a two-step commit:
//! serving a code snapshot only marks a sync as pending, and the site counts
//! as synced once the Gatekeeper acknowledges with `MARK_SUCCESS`.

use std::time::Duration;

use tracing::{debug, info, warn};

use keymaster_core::time::unix_millis;
use keymaster_core::{
    CheckResult, CodeDelivery, DoorCode, DoorRecord, EventBatch, Request, Response,
};
use keymaster_crypto::{CryptoError, TokenCipher};

use crate::storage::{DatabaseError, DoorCodeRow, KeymasterDatabase, Site};

/// Description given to sites created from an unknown IP.
pub const NEW_SITE_DESCRIPTION: &str = "New Keymaster";

/// Errors answering a Gatekeeper. All of them become an `error` reply.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("No Keymaster for incoming IP ({0})")]
    UnknownSite(String),

    #[error("Keymaster for this IP address is disabled ({0})")]
    SiteDisabled(String),

    #[error("Keymaster for this IP address has no encryption key ({0})")]
    MissingKey(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] keymaster_core::Error),

    #[error("'{0}' requires data")]
    MissingData(Request),

    #[error("Invalid data for '{request}': {reason}")]
    InvalidData { request: Request, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// The Keymaster side of the protocol.
#[derive(Debug, Clone)]
pub struct KeymasterService {
    db: KeymasterDatabase,
    message_ttl: Duration,
}

impl KeymasterService {
    pub const fn new(db: KeymasterDatabase, message_ttl: Duration) -> Self {
        Self { db, message_ttl }
    }

    pub const fn db(&self) -> &KeymasterDatabase {
        &self.db
    }

    /// Resolve the enabled site for `ip` and record the access.
    ///
    /// The first request from an unknown IP registers a disabled site so an
    /// administrator can enable it; that request is still refused.
    pub async fn site_for(&self, ip: &str) -> Result<Site, ServiceError> {
        let Some(site) = self.db.get_site_by_ip(ip).await? else {
            self.db
                .create_site(NEW_SITE_DESCRIPTION, ip, "", false, unix_millis())
                .await?;
            warn!(ip, "Registered disabled site for unknown Gatekeeper");
            return Err(ServiceError::UnknownSite(ip.to_string()));
        };
        if !site.is_enabled {
            return Err(ServiceError::SiteDisabled(ip.to_string()));
        }
        self.db.touch_site(site.id, unix_millis()).await?;
        Ok(site)
    }

    /// Token cipher for a site's key.
    pub fn cipher(&self, site: &Site) -> Result<TokenCipher, ServiceError> {
        if site.encryption_key.is_empty() {
            return Err(ServiceError::MissingKey(site.gatekeeper_ip.clone()));
        }
        Ok(TokenCipher::from_encoded_key(
            &site.encryption_key,
            self.message_ttl,
        )?)
    }

    /// Decrypt a sealed request from `ip`, answer it and seal the reply.
    pub async fn handle(
        &self,
        ip: &str,
        sealed_message: &str,
        sealed_data: Option<&str>,
    ) -> Result<String, ServiceError> {
        let site = self.site_for(ip).await?;
        let cipher = self.cipher(&site)?;

        let request: Request = cipher.decrypt_str(sealed_message)?.parse()?;
        let data = sealed_data
            .filter(|d| !d.is_empty())
            .map(|d| cipher.decrypt_str(d))
            .transpose()?;
        debug!(ip, site = site.id, request = %request, "Incoming request");

        let reply = self.respond(&site, request, data.as_deref()).await?;
        Ok(cipher.encrypt_str(&reply)?)
    }

    /// Plaintext reply to one request from `site`.
    pub async fn respond(
        &self,
        site: &Site,
        request: Request,
        data: Option<&str>,
    ) -> Result<String, ServiceError> {
        let response = match request {
            Request::TestQuestion => Response::TestResponse,
            Request::PullConfiguration => Response::Configuration(self.configuration(site).await?),
            Request::CheckDoorCodes => Response::Check(self.check_door_codes(site).await?),
            Request::PullDoorCodes => {
                let delivery = if self.check_door_codes(site).await? == CheckResult::NewData {
                    CodeDelivery::snapshot(self.serve_snapshot(site).await?)
                } else {
                    CodeDelivery::unchanged()
                };
                Response::DoorCodes(delivery)
            }
            Request::ForceSync => {
                Response::DoorCodes(CodeDelivery::snapshot(self.serve_snapshot(site).await?))
            }
            Request::MarkSuccess => {
                let updated = self.db.mark_success(site.id, unix_millis()).await?;
                if site.is_syncing {
                    info!(site = site.id, sync_at = ?updated.sync_at, "Gatekeeper sync committed");
                }
                Response::Success
            }
            Request::PushEventLogs => {
                let data = data.ok_or(ServiceError::MissingData(request))?;
                let batch: EventBatch =
                    serde_json::from_str(data).map_err(|e| ServiceError::InvalidData {
                        request,
                        reason: e.to_string(),
                    })?;
                self.store_events(site, &batch).await?;
                Response::Success
            }
            Request::PushGatekeeperLog => {
                let text = data.ok_or(ServiceError::MissingData(request))?;
                warn!(site = site.id, report = %text, "Gatekeeper reported a failure");
                self.db
                    .insert_gatekeeper_log(site.id, text, unix_millis())
                    .await?;
                Response::Success
            }
        };
        Ok(response.encode()?)
    }

    async fn configuration(&self, site: &Site) -> Result<Vec<DoorRecord>, ServiceError> {
        let mut records = Vec::new();
        for door in self.db.list_doors(site.id).await? {
            let last_event_ts = self.db.last_event_ts(door.id).await?;
            records.push(door.to_record(last_event_ts)?);
        }
        Ok(records)
    }

    /// New data when the site never synced, a sync awaits acknowledgement,
    /// or any code changed at or after the last committed sync.
    async fn check_door_codes(&self, site: &Site) -> Result<CheckResult, ServiceError> {
        let changed = match site.sync_at {
            None => true,
            Some(_) if site.is_syncing => true,
            Some(sync_at) => self.db.codes_changed_since(sync_at).await?,
        };
        Ok(if changed {
            CheckResult::NewData
        } else {
            CheckResult::NoData
        })
    }

    async fn serve_snapshot(&self, site: &Site) -> Result<Vec<DoorCode>, ServiceError> {
        // Stamp before reading so an edit racing the read is seen as newer.
        let now = unix_millis();
        let codes: Vec<_> = self
            .db
            .active_codes()
            .await?
            .iter()
            .map(DoorCodeRow::to_door_code)
            .collect();
        self.db.begin_sync(site.id, now).await?;
        info!(site = site.id, codes = codes.len(), "Serving door code snapshot");
        Ok(codes)
    }

    async fn store_events(&self, site: &Site, batch: &EventBatch) -> Result<(), ServiceError> {
        let now = unix_millis();
        for (door_name, events) in batch {
            // The door may have been removed since the agent's last configuration pull.
            let Some(door) = self.db.get_door_by_name(site.id, door_name).await? else {
                warn!(
                    site = site.id,
                    door = %door_name,
                    dropped = events.len(),
                    "Events for unknown door ignored"
                );
                continue;
            };
            let mut stored = 0usize;
            for event in events {
                let username = match (&event.username, &event.code) {
                    (Some(username), _) => Some(username.clone()),
                    (None, Some(code)) => self.db.find_code(code).await?.map(|c| c.username),
                    (None, None) => None,
                };
                if self
                    .db
                    .insert_event(door.id, event, username.as_deref(), now)
                    .await?
                {
                    stored += 1;
                }
            }
            info!(site = site.id, door = %door_name, received = events.len(), stored, "Stored door events");
        }
        Ok(())
    }
}
