//! The Keymaster message vocabulary.
//!
//! Every exchange is one request token sent by a Gatekeeper and one reply
//! from the Keymaster. Each request has a fixed set of acceptable replies;
//! anything else is a protocol error and is never interpreted as data.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{CodeDelivery, DoorRecord};

pub const TEST_QUESTION: &str = "Are you the Keymaster?";
pub const TEST_RESPONSE: &str = "Are you the Gatekeeper?";
pub const PULL_CONFIGURATION: &str = "pull_configuration";
pub const CHECK_DOOR_CODES: &str = "check_door_codes";
pub const PULL_DOOR_CODES: &str = "pull_door_codes";
pub const FORCE_SYNC: &str = "force_sync";
pub const MARK_SUCCESS: &str = "mark_success";
pub const PUSH_EVENT_LOGS: &str = "push_event_logs";
pub const PUSH_GATEKEEPER_LOG: &str = "push_gatekeeper_log";
pub const NEW_DATA: &str = "new_data";
pub const NO_DATA: &str = "no_new_data";
pub const SUCCESS_RESPONSE: &str = "OK";

/// A request a Gatekeeper can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    /// Handshake probe.
    TestQuestion,
    /// Fetch the site's full door configuration.
    PullConfiguration,
    /// Cheap poll: has anything changed since the last sync?
    CheckDoorCodes,
    /// Fetch the codes if anything changed since the last sync.
    PullDoorCodes,
    /// Fetch the full code set regardless of sync state.
    ForceSync,
    /// Acknowledge that the last delta was applied.
    MarkSuccess,
    /// Forward door events; carries a data payload.
    PushEventLogs,
    /// Report an agent-side failure; carries a data payload.
    PushGatekeeperLog,
}

impl Request {
    pub const ALL: [Self; 8] = [
        Self::TestQuestion,
        Self::PullConfiguration,
        Self::CheckDoorCodes,
        Self::PullDoorCodes,
        Self::ForceSync,
        Self::MarkSuccess,
        Self::PushEventLogs,
        Self::PushGatekeeperLog,
    ];

    /// Wire token for this request.
    pub const fn token(self) -> &'static str {
        match self {
            Self::TestQuestion => TEST_QUESTION,
            Self::PullConfiguration => PULL_CONFIGURATION,
            Self::CheckDoorCodes => CHECK_DOOR_CODES,
            Self::PullDoorCodes => PULL_DOOR_CODES,
            Self::ForceSync => FORCE_SYNC,
            Self::MarkSuccess => MARK_SUCCESS,
            Self::PushEventLogs => PUSH_EVENT_LOGS,
            Self::PushGatekeeperLog => PUSH_GATEKEEPER_LOG,
        }
    }

    /// Whether the request travels with a `data` payload.
    pub const fn carries_data(self) -> bool {
        matches!(self, Self::PushEventLogs | Self::PushGatekeeperLog)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.token() == s)
            .ok_or_else(|| Error::UnknownRequest(s.to_string()))
    }
}

/// Answer to `CHECK_DOOR_CODES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    NewData,
    NoData,
}

impl CheckResult {
    pub const fn token(self) -> &'static str {
        match self {
            Self::NewData => NEW_DATA,
            Self::NoData => NO_DATA,
        }
    }
}

/// A reply, tagged by the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    TestResponse,
    Configuration(Vec<DoorRecord>),
    Check(CheckResult),
    DoorCodes(CodeDelivery),
    Success,
}

impl Response {
    /// Interpret `raw` as the reply to `request`.
    ///
    /// Fails with [`Error::UnexpectedResponse`] when `raw` is not one of the
    /// replies `request` allows, including payloads that do not decode.
    pub fn parse(request: Request, raw: &str) -> Result<Self> {
        let unexpected = || Error::UnexpectedResponse {
            request: request.token().to_string(),
            response: truncate(raw),
        };
        match request {
            Request::TestQuestion => (raw == TEST_RESPONSE)
                .then_some(Self::TestResponse)
                .ok_or_else(unexpected),
            Request::CheckDoorCodes => match raw {
                NEW_DATA => Ok(Self::Check(CheckResult::NewData)),
                NO_DATA => Ok(Self::Check(CheckResult::NoData)),
                _ => Err(unexpected()),
            },
            Request::PullConfiguration => serde_json::from_str(raw)
                .map(Self::Configuration)
                .map_err(|_| unexpected()),
            Request::PullDoorCodes | Request::ForceSync => serde_json::from_str(raw)
                .map(Self::DoorCodes)
                .map_err(|_| unexpected()),
            Request::MarkSuccess | Request::PushEventLogs | Request::PushGatekeeperLog => {
                (raw == SUCCESS_RESPONSE)
                    .then_some(Self::Success)
                    .ok_or_else(unexpected)
            }
        }
    }

    /// Serialize the reply for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Self::TestResponse => TEST_RESPONSE.to_string(),
            Self::Configuration(doors) => serde_json::to_string(doors)?,
            Self::Check(result) => result.token().to_string(),
            Self::DoorCodes(delivery) => serde_json::to_string(delivery)?,
            Self::Success => SUCCESS_RESPONSE.to_string(),
        })
    }
}

/// Keep log lines bounded when a peer sends something huge.
fn truncate(raw: &str) -> String {
    const MAX: usize = 120;
    if raw.len() <= MAX {
        return raw.to_string();
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DoorCode, DoorType};

    #[test]
    fn request_tokens_roundtrip() {
        for request in Request::ALL {
            assert_eq!(request.token().parse::<Request>().unwrap(), request);
        }
    }

    #[test]
    fn unknown_request_is_rejected() {
        assert!(matches!(
            "check_in".parse::<Request>(),
            Err(Error::UnknownRequest(_))
        ));
    }

    #[test]
    fn only_push_requests_carry_data() {
        let with_data: Vec<_> = Request::ALL
            .into_iter()
            .filter(|r| r.carries_data())
            .collect();
        assert_eq!(
            with_data,
            vec![Request::PushEventLogs, Request::PushGatekeeperLog]
        );
    }

    #[test]
    fn handshake_requires_exact_reply() {
        assert_eq!(
            Response::parse(Request::TestQuestion, TEST_RESPONSE).unwrap(),
            Response::TestResponse
        );
        assert!(Response::parse(Request::TestQuestion, "Are you the Keymaster?").is_err());
    }

    #[test]
    fn check_reply_vocabulary() {
        assert_eq!(
            Response::parse(Request::CheckDoorCodes, NEW_DATA).unwrap(),
            Response::Check(CheckResult::NewData)
        );
        assert_eq!(
            Response::parse(Request::CheckDoorCodes, NO_DATA).unwrap(),
            Response::Check(CheckResult::NoData)
        );
        assert!(matches!(
            Response::parse(Request::CheckDoorCodes, SUCCESS_RESPONSE),
            Err(Error::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn vocabulary_token_is_not_parsed_as_code_list() {
        assert!(Response::parse(Request::PullDoorCodes, NEW_DATA).is_err());
        assert!(Response::parse(Request::ForceSync, "{\"code\":1}").is_err());
    }

    #[test]
    fn empty_code_list_is_valid() {
        assert_eq!(
            Response::parse(Request::PullDoorCodes, "[]").unwrap(),
            Response::DoorCodes(CodeDelivery::unchanged())
        );
    }

    #[test]
    fn empty_snapshot_is_distinct_from_no_change() {
        let Response::DoorCodes(delivery) =
            Response::parse(Request::ForceSync, r#"{"snapshot":[]}"#).unwrap()
        else {
            unreachable!("door codes expected");
        };
        assert!(delivery.is_authoritative());
        assert!(Response::parse(Request::PullDoorCodes, r#"{"codes":[]}"#).is_err());
    }

    #[test]
    fn configuration_reply_parses_doors() {
        let raw = r#"[{"name":"front","door_type":"test","ip_address":"127.0.0.1",
            "username":"u","password":"p"}]"#;
        let Response::Configuration(doors) =
            Response::parse(Request::PullConfiguration, raw).unwrap()
        else {
            unreachable!("configuration expected");
        };
        assert_eq!(doors[0].door_type, DoorType::Test);
    }

    #[test]
    fn ack_requests_require_ok() {
        for request in [
            Request::MarkSuccess,
            Request::PushEventLogs,
            Request::PushGatekeeperLog,
        ] {
            assert_eq!(
                Response::parse(request, SUCCESS_RESPONSE).unwrap(),
                Response::Success
            );
            assert!(Response::parse(request, "ok").is_err());
        }
    }

    #[test]
    fn encode_then_parse_door_codes() {
        let reply = Response::DoorCodes(CodeDelivery::snapshot(vec![DoorCode::new(
            "1234", "alice",
        )]));
        let wire = reply.encode().unwrap();
        assert_eq!(Response::parse(Request::PullDoorCodes, &wire).unwrap(), reply);
    }

    #[test]
    fn unexpected_response_is_truncated() {
        let huge = "x".repeat(10_000);
        let Err(Error::UnexpectedResponse { response, .. }) =
            Response::parse(Request::MarkSuccess, &huge)
        else {
            unreachable!("error expected");
        };
        assert!(response.len() < 200);
    }
}
