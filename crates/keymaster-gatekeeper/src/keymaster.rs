//! Typed request helpers on top of a [`KeymasterLink`].
//!
//! Every method sends exactly one request and checks the reply against the
//! closed vocabulary before anything is returned to the caller.

use std::sync::Arc;

use tracing::debug;

use keymaster_core::{CheckResult, EventBatch, Request, Response};

use crate::channel::KeymasterLink;
use crate::error::{GatekeeperError, Result};

/// Keymaster client shared by the loops and the supervisor.
#[derive(Clone)]
pub struct KeymasterClient {
    link: Arc<dyn KeymasterLink>,
}

impl KeymasterClient {
    pub fn new(link: Arc<dyn KeymasterLink>) -> Self {
        Self { link }
    }

    async fn exchange(&self, request: Request, data: Option<&str>) -> Result<Response> {
        let raw = self.link.send_message(request.token(), data).await?;
        debug!(request = %request, reply_len = raw.len(), "Keymaster replied");
        Response::parse(request, &raw).map_err(GatekeeperError::Protocol)
    }

    /// `TEST_QUESTION` handshake.
    pub async fn handshake(&self) -> Result<()> {
        self.exchange(Request::TestQuestion, None).await.map(|_| ())
    }

    /// Raw configuration payload, for [`crate::Gatekeeper::configure_doors`].
    ///
    /// The reply is still validated as a door list before it is returned.
    pub async fn pull_configuration(&self) -> Result<String> {
        let raw = self
            .link
            .send_message(Request::PullConfiguration.token(), None)
            .await?;
        Response::parse(Request::PullConfiguration, &raw).map_err(GatekeeperError::Protocol)?;
        Ok(raw)
    }

    /// `CHECK_DOOR_CODES`.
    pub async fn check_door_codes(&self) -> Result<CheckResult> {
        match self.exchange(Request::CheckDoorCodes, None).await? {
            Response::Check(result) => Ok(result),
            other => Err(unexpected(Request::CheckDoorCodes, &other)),
        }
    }

    /// Raw code snapshot; `force` sends `FORCE_SYNC` instead of `PULL_DOOR_CODES`.
    pub async fn pull_door_codes(&self, force: bool) -> Result<String> {
        let request = if force {
            Request::ForceSync
        } else {
            Request::PullDoorCodes
        };
        let raw = self.link.send_message(request.token(), None).await?;
        Response::parse(request, &raw).map_err(GatekeeperError::Protocol)?;
        Ok(raw)
    }

    /// `MARK_SUCCESS`. Anything but `OK` is a desync.
    pub async fn mark_success(&self) -> Result<()> {
        let raw = self
            .link
            .send_message(Request::MarkSuccess.token(), None)
            .await?;
        match Response::parse(Request::MarkSuccess, &raw) {
            Ok(_) => Ok(()),
            Err(e) => Err(GatekeeperError::Desync(e.to_string())),
        }
    }

    /// `PUSH_EVENT_LOGS` with the batch as JSON data.
    pub async fn push_event_logs(&self, batch: &EventBatch) -> Result<()> {
        let data = serde_json::to_string(batch).map_err(keymaster_core::Error::from)?;
        self.exchange(Request::PushEventLogs, Some(&data))
            .await
            .map(|_| ())
    }

    /// `PUSH_GATEKEEPER_LOG` with free text.
    pub async fn push_gatekeeper_log(&self, text: &str) -> Result<()> {
        self.exchange(Request::PushGatekeeperLog, Some(text))
            .await
            .map(|_| ())
    }
}

fn unexpected(request: Request, reply: &Response) -> GatekeeperError {
    GatekeeperError::Protocol(keymaster_core::Error::UnexpectedResponse {
        request: request.token().to_string(),
        response: format!("{reply:?}"),
    })
}
