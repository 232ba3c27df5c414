//! NIP-01 wire messages and subscription filters.
//!
//! Frames are JSON arrays whose first element names the command:
//!
//! ```text
//! client -> relay   ["EVENT", event] | ["REQ", sub, filter, ...] | ["CLOSE", sub]
//! relay  -> client  ["EVENT", sub, event] | ["OK", id, bool, msg] | ["EOSE", sub] | ["NOTICE", msg]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{error::ProtocolError, event::Event};

/// Subscription filter. Absent clauses impose no constraint.
///
/// Clauses this relay does not know (e.g. `ids`, `#t`) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// Accepted `d` tag values.
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn identifier(mut self, d: impl Into<String>) -> Self {
        self.d.get_or_insert_with(Vec::new).push(d.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `ev` satisfies every present clause. `limit` is applied by the
    /// caller over the whole result set.
    ///
    /// An event without a `d` tag never matches a `#d` clause.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(ds) = &self.d {
            match ev.identifier() {
                Some(d) if ds.iter().any(|v| v == d) => {}
                _ => return false,
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s) && self.until.map_or(true, |u| ev.created_at <= u)
    }
}

/// Relay acknowledgement for a submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

impl Ack {
    pub fn accepted(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: false,
            message: message.into(),
        }
    }
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (command, args) = split_frame(text)?;
        match command.as_str() {
            "EVENT" => {
                let ev = args.into_iter().next().ok_or(ProtocolError::Malformed {
                    command: "EVENT",
                    reason: "missing event".into(),
                })?;
                let ev = serde_json::from_value(ev).map_err(|e| malformed("EVENT", e))?;
                Ok(ClientMessage::Event(Box::new(ev)))
            }
            "REQ" => {
                let mut args = args.into_iter();
                let subscription_id = string_arg("REQ", args.next())?;
                let filters = args
                    .map(|f| serde_json::from_value(f).map_err(|e| malformed("REQ", e)))
                    .collect::<Result<Vec<Filter>, _>>()?;
                if filters.is_empty() {
                    return Err(ProtocolError::Malformed {
                        command: "REQ",
                        reason: "missing filter".into(),
                    });
                }
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close(string_arg(
                "CLOSE",
                args.into_iter().next(),
            )?)),
            _ => Err(ProtocolError::UnknownCommand(command)),
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Event(ev) => json!(["EVENT", ev]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                arr.extend(filters.iter().map(|f| json!(f)));
                Value::Array(arr)
            }
            ClientMessage::Close(sub) => json!(["CLOSE", sub]),
        }
        .to_string()
    }
}

/// Messages sent by relays.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok(Ack),
    Eose(String),
    Notice(String),
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (command, args) = split_frame(text)?;
        let mut args = args.into_iter();
        match command.as_str() {
            "EVENT" => {
                let subscription_id = string_arg("EVENT", args.next())?;
                let ev = args.next().ok_or(ProtocolError::Malformed {
                    command: "EVENT",
                    reason: "missing event".into(),
                })?;
                let event = serde_json::from_value(ev).map_err(|e| malformed("EVENT", e))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => {
                let event_id = string_arg("OK", args.next())?;
                let accepted = args
                    .next()
                    .and_then(|v| v.as_bool())
                    .ok_or(ProtocolError::Malformed {
                        command: "OK",
                        reason: "missing status".into(),
                    })?;
                let message = args
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                Ok(RelayMessage::Ok(Ack {
                    event_id,
                    accepted,
                    message,
                }))
            }
            "EOSE" => Ok(RelayMessage::Eose(string_arg("EOSE", args.next())?)),
            "NOTICE" => Ok(RelayMessage::Notice(string_arg("NOTICE", args.next())?)),
            _ => Err(ProtocolError::UnknownCommand(command)),
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok(ack) => json!(["OK", ack.event_id, ack.accepted, ack.message]),
            RelayMessage::Eose(sub) => json!(["EOSE", sub]),
            RelayMessage::Notice(msg) => json!(["NOTICE", msg]),
        }
        .to_string()
    }
}

/// Split a frame into its command and remaining elements.
fn split_frame(text: &str) -> Result<(String, Vec<Value>), ProtocolError> {
    let val: Value = serde_json::from_str(text)?;
    let Value::Array(mut arr) = val else {
        return Err(ProtocolError::NotCommand);
    };
    if arr.is_empty() {
        return Err(ProtocolError::NotCommand);
    }
    match arr.remove(0) {
        Value::String(command) => Ok((command, arr)),
        _ => Err(ProtocolError::NotCommand),
    }
}

fn string_arg(command: &'static str, val: Option<Value>) -> Result<String, ProtocolError> {
    match val {
        Some(Value::String(s)) => Ok(s),
        _ => Err(ProtocolError::Malformed {
            command,
            reason: "expected a string".into(),
        }),
    }
}

fn malformed(command: &'static str, e: serde_json::Error) -> ProtocolError {
    ProtocolError::Malformed {
        command,
        reason: e.to_string(),
    }
}
