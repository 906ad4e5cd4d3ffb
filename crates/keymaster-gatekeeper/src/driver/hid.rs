//! HID VertX controller driver (XML over HTTPS).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{debug, info};

use keymaster_core::{DoorEvent, DoorRecord};

use super::hid_xml::{self, Attributes};
use super::{Credential, CredentialChange, DoorDriver, DoorStatus, DriverError};

/// Page size used when walking the cardholder list.
const CARDHOLDER_PAGE: usize = 10;

/// Bound on a single controller round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Default)]
struct Holder {
    username: String,
    code: Option<String>,
}

/// Driver for one VertX controller.
///
/// Requests to the same controller are serialised; the controller handles
/// one XML command at a time.
pub struct HidDoorDriver {
    name: String,
    url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    request_lock: tokio::sync::Mutex<()>,
    holders: tokio::sync::Mutex<HashMap<String, Holder>>,
}

impl HidDoorDriver {
    pub fn new(record: &DoorRecord) -> Result<Self, DriverError> {
        // reqwest uses rustls-no-provider; `Err` means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;
        Ok(Self {
            name: record.name.clone(),
            url: format!("https://{}/cgi-bin/vertx_xml.cgi", record.ip_address),
            username: record.username.clone(),
            password: record.password.clone(),
            http,
            request_lock: tokio::sync::Mutex::new(()),
            holders: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn send(&self, xml: String) -> Result<String, DriverError> {
        debug!(door = %self.name, request = %xml, "Sending VertX command");
        let _guard = self.request_lock.lock().await;
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("XML", xml)])
            .send()
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;
        debug!(door = %self.name, status = status.as_u16(), "VertX reply");

        if status != reqwest::StatusCode::OK {
            return Err(DriverError::Command(format!("HTTP {status}")));
        }
        if let Some(error) = hid_xml::error_message(&body) {
            return Err(DriverError::Command(error));
        }
        Ok(body)
    }

    async fn refresh_holders(&self) -> Result<(), DriverError> {
        let mut holders = HashMap::new();
        let mut offset = 0;
        loop {
            let reply = self
                .send(hid_xml::list_cardholders(offset, CARDHOLDER_PAGE))
                .await?;
            let page = hid_xml::elements(&reply, "Cardholder");
            for person in &page {
                let Some(id) = person.get("cardholderID") else {
                    continue;
                };
                let username = person
                    .get("username")
                    .or_else(|| person.get("custom1"))
                    .cloned()
                    .unwrap_or_default();
                holders.insert(id.clone(), Holder { username, code: None });
            }
            if page.len() < CARDHOLDER_PAGE {
                break;
            }
            offset += page.len();
        }
        debug!(door = %self.name, cardholders = holders.len(), "Loaded cardholders");
        *self.holders.lock().await = holders;
        Ok(())
    }

    async fn add(&self, code: &keymaster_core::DoorCode) -> Result<(), DriverError> {
        let reply = self
            .send(hid_xml::create_cardholder(
                code.first_name.as_deref().unwrap_or_default(),
                code.last_name.as_deref().unwrap_or_default(),
                &code.username,
            ))
            .await?;
        let holder_id = hid_xml::attribute(&reply, "cardholderID").ok_or_else(|| {
            DriverError::Protocol(format!("no cardholderID for {}", code.username))
        })?;
        self.send(hid_xml::create_credential(&code.code)).await?;
        self.send(hid_xml::assign_credential(&holder_id, &code.code))
            .await?;
        self.send(hid_xml::add_roleset(&holder_id)).await?;
        info!(door = %self.name, username = %code.username, cardholder = %holder_id, "Added cardholder");

        self.holders.lock().await.insert(
            holder_id,
            Holder {
                username: code.username.clone(),
                code: Some(code.code.clone()),
            },
        );
        Ok(())
    }

    async fn change(
        &self,
        holder_id: Option<&str>,
        username: &str,
        old_code: &str,
        new_code: &str,
    ) -> Result<(), DriverError> {
        let holder_id = holder_id.ok_or_else(|| {
            DriverError::Command(format!("no cardholder on record for {username}"))
        })?;
        self.send(hid_xml::delete_credential(old_code)).await?;
        self.send(hid_xml::create_credential(new_code)).await?;
        self.send(hid_xml::assign_credential(holder_id, new_code))
            .await?;
        info!(door = %self.name, username, cardholder = %holder_id, "Changed credential");
        if let Some(holder) = self.holders.lock().await.get_mut(holder_id) {
            holder.code = Some(new_code.to_string());
        }
        Ok(())
    }

    async fn remove(&self, credential: &Credential) -> Result<(), DriverError> {
        self.send(hid_xml::delete_credential(&credential.code))
            .await?;
        if let Some(holder_id) = &credential.holder_id {
            self.send(hid_xml::delete_cardholder(holder_id)).await?;
            self.holders.lock().await.remove(holder_id);
        }
        info!(door = %self.name, username = %credential.username, "Removed credential");
        Ok(())
    }

    fn door_status(&self, attrs: &Attributes) -> DoorStatus {
        DoorStatus {
            name: attrs
                .get("doorName")
                .cloned()
                .unwrap_or_else(|| self.name.clone()),
            locked: attrs.get("relayState").is_some_and(|s| s == "set"),
        }
    }
}

impl std::fmt::Debug for HidDoorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidDoorDriver")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DoorDriver for HidDoorDriver {
    async fn test_connection(&self) -> Result<(), DriverError> {
        self.send(hid_xml::list_doors()).await.map(|_| ())
    }

    async fn lock(&self) -> Result<(), DriverError> {
        self.send(hid_xml::door_command("lockDoor")).await?;
        info!(door = %self.name, "Door locked");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), DriverError> {
        self.send(hid_xml::door_command("unlockDoor")).await?;
        info!(door = %self.name, "Door unlocked");
        Ok(())
    }

    async fn is_locked(&self) -> Result<bool, DriverError> {
        let reply = self.send(hid_xml::list_doors()).await?;
        Ok(hid_xml::attribute(&reply, "relayState").is_some_and(|s| s == "set"))
    }

    async fn list_doors(&self) -> Result<Vec<DoorStatus>, DriverError> {
        let reply = self.send(hid_xml::list_doors()).await?;
        let doors = hid_xml::elements(&reply, "Door");
        if doors.is_empty() {
            let locked = hid_xml::attribute(&reply, "relayState").is_some_and(|s| s == "set");
            return Ok(vec![DoorStatus {
                name: self.name.clone(),
                locked,
            }]);
        }
        Ok(doors.iter().map(|d| self.door_status(d)).collect())
    }

    async fn list_credentials(
        &self,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Credential>, DriverError> {
        if offset == 0 {
            self.refresh_holders().await?;
        }
        let reply = self
            .send(hid_xml::list_credentials(offset, count))
            .await?;
        let mut holders = self.holders.lock().await;
        let credentials = hid_xml::elements(&reply, "Credential")
            .into_iter()
            .filter_map(|card| {
                let code = card.get("rawCardNumber")?.clone();
                let holder_id = card.get("cardholderID").cloned();
                let username = holder_id
                    .as_ref()
                    .and_then(|id| holders.get_mut(id))
                    .map(|holder| {
                        holder.code = Some(code.clone());
                        holder.username.clone()
                    })
                    .unwrap_or_default();
                Some(Credential {
                    holder_id,
                    username,
                    code,
                })
            })
            .collect();
        Ok(credentials)
    }

    async fn apply_changes(&self, changes: &[CredentialChange]) -> Result<(), DriverError> {
        for change in changes {
            match change {
                CredentialChange::Add { code } => self.add(code).await?,
                CredentialChange::Change {
                    holder_id,
                    username,
                    old_code,
                    new_code,
                } => {
                    self.change(holder_id.as_deref(), username, old_code, new_code)
                        .await?;
                }
                CredentialChange::Remove { credential } => self.remove(credential).await?,
            }
        }
        Ok(())
    }

    async fn pull_event_log(&self, records: usize) -> Result<Vec<DoorEvent>, DriverError> {
        if self.holders.lock().await.is_empty() {
            self.refresh_holders().await?;
        }

        let overview = self.send(hid_xml::list_events(None)).await?;
        let marker = hid_xml::attribute(&overview, "currentRecordMarker")
            .ok_or_else(|| DriverError::Protocol("no currentRecordMarker".into()))?;
        let timestamp = hid_xml::attribute(&overview, "currentTimestamp")
            .ok_or_else(|| DriverError::Protocol("no currentTimestamp".into()))?;

        let reply = self
            .send(hid_xml::list_events(Some((records, &marker, &timestamp))))
            .await?;
        let holders = self.holders.lock().await;
        let events = hid_xml::elements(&reply, "EventMessage")
            .iter()
            .filter_map(|attrs| {
                hid_xml::parse_event(attrs, |id| {
                    holders
                        .get(id)
                        .map(|h| (h.username.clone(), h.code.clone()))
                })
            })
            .collect();
        Ok(events)
    }

    async fn sync_clock(&self, now: NaiveDateTime) -> Result<(), DriverError> {
        self.send(hid_xml::set_time(now)).await?;
        info!(door = %self.name, time = %now, "Controller clock set");
        Ok(())
    }
}
