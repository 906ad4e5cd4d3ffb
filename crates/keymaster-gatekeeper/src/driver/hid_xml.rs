//! VertX XML messages: builders for the commands the driver sends and a
//! minimal attribute reader for the replies.
//!
//! Replies are flat lists of self-describing elements, so attributes are
//! read with regexes rather than a full XML parser.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDateTime, Timelike};
use regex::Regex;

use keymaster_core::{DoorEvent, DoorEventType};

#[allow(clippy::expect_used)]
static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*"([^"]*)""#).expect("static regex is valid")
});

/// Attributes of one element.
pub type Attributes = HashMap<String, String>;

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn element(tag: &str, attrs: &[(&str, &str)], children: &str) -> String {
    let mut out = format!("<hid:{tag}");
    for (name, value) in attrs {
        let _ = write!(out, " {name}=\"{}\"", escape(value));
    }
    if children.is_empty() {
        out.push_str("/>");
    } else {
        let _ = write!(out, ">{children}</hid:{tag}>");
    }
    out
}

fn message(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><VertXMessage xmlns:hid="http://www.hidcorp.com/VertX">{body}</VertXMessage>"#
    )
}

// =========================================================================
// Doors
// =========================================================================

pub fn list_doors() -> String {
    message(&element(
        "Doors",
        &[("action", "LR"), ("responseFormat", "status")],
        "",
    ))
}

pub fn door_command(command: &str) -> String {
    message(&element(
        "Doors",
        &[("action", "CM"), ("command", command)],
        "",
    ))
}

// =========================================================================
// Cardholders
// =========================================================================

pub fn list_cardholders(offset: usize, count: usize) -> String {
    let (offset, count) = (offset.to_string(), count.to_string());
    message(&element(
        "Cardholders",
        &[
            ("action", "LR"),
            ("responseFormat", "expanded"),
            ("recordOffset", &offset),
            ("recordCount", &count),
        ],
        "",
    ))
}

pub fn create_cardholder(first_name: &str, last_name: &str, username: &str) -> String {
    let child = element(
        "Cardholder",
        &[
            ("forename", first_name),
            ("surname", last_name),
            ("custom1", username),
        ],
        "",
    );
    message(&element("Cardholders", &[("action", "AD")], &child))
}

pub fn delete_cardholder(holder_id: &str) -> String {
    message(&element(
        "Cardholders",
        &[("action", "DD"), ("cardholderID", holder_id)],
        "",
    ))
}

// =========================================================================
// Credentials
// =========================================================================

pub fn list_credentials(offset: usize, count: usize) -> String {
    let (offset, count) = (offset.to_string(), count.to_string());
    message(&element(
        "Credentials",
        &[
            ("action", "LR"),
            ("responseFormat", "expanded"),
            ("recordOffset", &offset),
            ("recordCount", &count),
        ],
        "",
    ))
}

pub fn create_credential(card_number: &str) -> String {
    let child = element(
        "Credential",
        &[("isCard", "true"), ("cardNumber", card_number)],
        "",
    );
    message(&element("Credentials", &[("action", "AD")], &child))
}

pub fn assign_credential(holder_id: &str, card_number: &str) -> String {
    let child = element("Credential", &[("cardholderID", holder_id)], "");
    message(&element(
        "Credentials",
        &[
            ("action", "UD"),
            ("isCard", "true"),
            ("rawCardNumber", card_number),
        ],
        &child,
    ))
}

pub fn delete_credential(card_number: &str) -> String {
    message(&element(
        "Credentials",
        &[
            ("action", "DD"),
            ("isCard", "true"),
            ("rawCardNumber", card_number),
        ],
        "",
    ))
}

/// Grant the cardholder the factory 24x7 role.
pub fn add_roleset(holder_id: &str) -> String {
    let role = element(
        "Role",
        &[
            ("roleID", holder_id),
            ("scheduleID", "1"),
            ("resourceID", "0"),
        ],
        "",
    );
    let roles = element("Roles", &[], &role);
    message(&element(
        "RoleSet",
        &[("action", "UD"), ("roleSetID", holder_id)],
        &roles,
    ))
}

// =========================================================================
// Events and system
// =========================================================================

/// Event overview, or a history page when `history` is given as
/// `(record_count, record_marker, timestamp)`.
pub fn list_events(history: Option<(usize, &str, &str)>) -> String {
    match history {
        None => message(&element("EventMessages", &[("action", "LR")], "")),
        Some((count, marker, timestamp)) => {
            let count = count.to_string();
            message(&element(
                "EventMessages",
                &[
                    ("action", "LR"),
                    ("recordCount", &count),
                    ("historyRecordMarker", marker),
                    ("historyTimestamp", timestamp),
                ],
                "",
            ))
        }
    }
}

pub fn set_time(now: NaiveDateTime) -> String {
    let fields = [
        now.year().to_string(),
        now.month().to_string(),
        now.day().to_string(),
        now.hour().to_string(),
        now.minute().to_string(),
        now.second().to_string(),
    ];
    message(&element(
        "Time",
        &[
            ("action", "UD"),
            ("year", &fields[0]),
            ("month", &fields[1]),
            ("dayOfMonth", &fields[2]),
            ("hour", &fields[3]),
            ("minute", &fields[4]),
            ("second", &fields[5]),
        ],
        "",
    ))
}

// =========================================================================
// Reply parsing
// =========================================================================

fn parse_attributes(raw: &str) -> Attributes {
    ATTRIBUTE_RE
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

/// Attributes of every `<hid:{tag} ...>` element, in document order.
pub fn elements(xml: &str, tag: &str) -> Vec<Attributes> {
    let open = format!("<hid:{tag}");
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        // Skip longer tag names sharing the prefix (`Credential` vs `Credentials`).
        let boundary = after.chars().next();
        let Some(end) = after.find('>') else { break };
        if matches!(boundary, Some(c) if c.is_whitespace() || c == '/' || c == '>') {
            found.push(parse_attributes(&after[..end]));
        }
        rest = &after[end..];
    }
    found
}

/// First occurrence of `name="..."` anywhere in the reply.
pub fn attribute(xml: &str, name: &str) -> Option<String> {
    ATTRIBUTE_RE
        .captures_iter(xml)
        .find(|c| &c[1] == name)
        .map(|c| unescape(&c[2]))
}

/// Controller-reported failure, if the reply carries one.
pub fn error_message(xml: &str) -> Option<String> {
    attribute(xml, "errorMessage").filter(|m| !m.is_empty())
}

/// Description of a controller event code.
pub fn event_description(code: &str) -> Option<&'static str> {
    Some(match code {
        "1022" => "Denied Access - Card Not Found",
        "1023" => "Denied Access - Access PIN Not Found",
        "2020" => "Granted Access",
        "2021" => "Granted Access - Extended Time",
        "2024" => "Denied Access - Schedule",
        "2029" => "Denied Access - Wrong PIN",
        "2036" => "Denied Access - Card Expired",
        "2042" => "Denied Access - PIN Lockout",
        "2043" => "Denied Access - Unassigned Card",
        "2044" => "Denied Access - Unassigned Access PIN",
        "2046" => "Denied Access - PIN Expired",
        "4034" => "Alarm Acknowledged",
        "4035" => "Door Locked-Scheduled",
        "4036" => "Door Unlocked-Scheduled",
        "4041" => "Door Forced Alarm",
        "4042" => "Door Held Alarm",
        "4043" => "Tamper Switch Alarm",
        "4044" => "Input A Alarm",
        "4045" => "Input B Alarm",
        "7020" => "Time Set",
        "12031" => "Granted Access - Manual",
        "12032" => "Door Unlocked",
        "12033" => "Door Locked",
        _ => return None,
    })
}

/// Map one `<hid:EventMessage>` to a door event.
///
/// `resolve` looks a cardholder id up as `(username, code)`. Returns `None`
/// when the element has no readable timestamp.
pub fn parse_event(
    attrs: &Attributes,
    resolve: impl Fn(&str) -> Option<(String, Option<String>)>,
) -> Option<DoorEvent> {
    let timestamp = NaiveDateTime::parse_from_str(
        attrs.get("timestamp")?,
        keymaster_core::time::DOOR_TS_FORMAT,
    )
    .ok()?;
    let hid_code = attrs.get("eventType").map_or("", String::as_str);
    let raw_card = attrs.get("rawCardNumber").cloned();

    let (event_type, description) = match hid_code {
        "1022" => (DoorEventType::UnrecognizedCard, "Card Not Found".to_string()),
        "2036" | "2043" => (DoorEventType::AccessDenied, "Access Denied".to_string()),
        "2020" | "2021" => (
            DoorEventType::AccessGranted,
            format!(
                "Access Granted ({} {})",
                attrs.get("forename").map_or("", String::as_str),
                attrs.get("surname").map_or("", String::as_str)
            ),
        ),
        "4036" | "12032" => (DoorEventType::DoorUnlocked, "Door Unlocked".to_string()),
        "4035" | "12033" => (DoorEventType::DoorLocked, "Door Locked".to_string()),
        other => (
            DoorEventType::Unknown,
            event_description(other).map_or_else(
                || format!("Unknown event {other}"),
                ToString::to_string,
            ),
        ),
    };

    let holder = attrs.get("cardholderID").and_then(|id| resolve(id));
    let (username, code) = match holder {
        Some((username, code)) => (Some(username), code.or(raw_card)),
        None => (None, raw_card),
    };

    Some(DoorEvent {
        timestamp,
        code,
        event_type,
        description,
        username,
    })
}
