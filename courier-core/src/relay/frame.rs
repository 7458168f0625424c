//! Relay wire frames.
//!
//! Frames are JSON arrays whose first element names the frame type.
//! Parsing is strict: wrong arity, wrong element types or unknown frame
//! types are rejected with a [`FrameError`] rather than guessed at.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::FrameError;
use crate::envelope::Envelope;

/// Subscription filter sent with a REQ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event kinds to match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,

    /// Recipient keys (`p` tag values) to match.
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,

    /// Only envelopes created at or after this Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    /// Maximum number of stored envelopes to replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    /// Direct messages addressed to `recipient`.
    #[must_use]
    pub fn direct_messages_to(recipient: &str) -> Self {
        Self {
            kinds: vec![crate::envelope::KIND_DIRECT_MESSAGE],
            recipients: vec![recipient.to_string()],
            since: None,
            limit: None,
        }
    }

    /// Sets the lower time bound.
    #[must_use]
    pub const fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the replay limit.
    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns whether `envelope` matches every populated field.
    #[must_use]
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&envelope.kind) {
            return false;
        }
        if !self.recipients.is_empty()
            && !self
                .recipients
                .iter()
                .any(|p| crate::envelope::TagBuilder::find_all(&envelope.tags, "p").any(|t| t == p))
        {
            return false;
        }
        self.since.is_none_or(|since| envelope.created_at >= since)
    }
}

/// Frames sent from client to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `["EVENT", <envelope>]`
    Event(Box<Envelope>),
    /// `["REQ", <subscription_id>, <filter>]`
    Req {
        /// Subscription id.
        subscription_id: String,
        /// Filter.
        filter: Filter,
    },
    /// `["CLOSE", <subscription_id>]`
    Close(String),
}

impl ClientMessage {
    /// Serializes the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if an element fails to serialize.
    pub fn to_json(&self) -> Result<String, FrameError> {
        let value = match self {
            Self::Event(envelope) => serde_json::json!(["EVENT", envelope]),
            Self::Req {
                subscription_id,
                filter,
            } => serde_json::json!(["REQ", subscription_id, filter]),
            Self::Close(subscription_id) => serde_json::json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    /// Parses a client frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first violation.
    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        let (kind, items) = split_frame(text)?;
        match kind.as_str() {
            "EVENT" => {
                expect_arity("EVENT", &items, 2)?;
                Ok(Self::Event(Box::new(envelope_at("EVENT", &items[1])?)))
            }
            "REQ" => {
                expect_arity("REQ", &items, 3)?;
                let subscription_id = string_at("REQ", "subscription_id", &items[1])?;
                let filter = serde_json::from_value(items[2].clone()).map_err(|e| {
                    FrameError::InvalidField {
                        frame: "REQ",
                        field: "filter",
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self::Req {
                    subscription_id,
                    filter,
                })
            }
            "CLOSE" => {
                expect_arity("CLOSE", &items, 2)?;
                Ok(Self::Close(string_at("CLOSE", "subscription_id", &items[1])?))
            }
            _ => Err(FrameError::UnknownType(kind)),
        }
    }
}

/// Frames sent from relay to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <envelope>]`
    Event {
        /// Subscription the envelope matched.
        subscription_id: String,
        /// The envelope.
        envelope: Box<Envelope>,
    },
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        /// Id of the published envelope.
        event_id: String,
        /// Whether the relay stored it.
        accepted: bool,
        /// Relay-provided reason.
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice(String),
    /// `["EOSE", <subscription_id>]`
    Eose(String),
}

impl RelayMessage {
    /// Returns a short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Event { .. } => "EVENT",
            Self::Ok { .. } => "OK",
            Self::Notice(_) => "NOTICE",
            Self::Eose(_) => "EOSE",
        }
    }

    /// Serializes the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if an element fails to serialize.
    pub fn to_json(&self) -> Result<String, FrameError> {
        let value = match self {
            Self::Event {
                subscription_id,
                envelope,
            } => serde_json::json!(["EVENT", subscription_id, envelope]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            Self::Notice(message) => serde_json::json!(["NOTICE", message]),
            Self::Eose(subscription_id) => serde_json::json!(["EOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    /// Parses a relay frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first violation.
    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        let (kind, items) = split_frame(text)?;
        match kind.as_str() {
            "EVENT" => {
                expect_arity("EVENT", &items, 3)?;
                Ok(Self::Event {
                    subscription_id: string_at("EVENT", "subscription_id", &items[1])?,
                    envelope: Box::new(envelope_at("EVENT", &items[2])?),
                })
            }
            "OK" => {
                expect_arity("OK", &items, 4)?;
                let event_id = string_at("OK", "event_id", &items[1])?;
                if event_id.len() != 64 || !event_id.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(FrameError::InvalidField {
                        frame: "OK",
                        field: "event_id",
                        reason: "expected 64 hex characters".to_string(),
                    });
                }
                let accepted = items[2].as_bool().ok_or_else(|| FrameError::InvalidField {
                    frame: "OK",
                    field: "accepted",
                    reason: "expected boolean".to_string(),
                })?;
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message: string_at("OK", "message", &items[3])?,
                })
            }
            "NOTICE" => {
                expect_arity("NOTICE", &items, 2)?;
                Ok(Self::Notice(string_at("NOTICE", "message", &items[1])?))
            }
            "EOSE" => {
                expect_arity("EOSE", &items, 2)?;
                Ok(Self::Eose(string_at("EOSE", "subscription_id", &items[1])?))
            }
            _ => Err(FrameError::UnknownType(kind)),
        }
    }
}

fn split_frame(text: &str) -> Result<(String, Vec<Value>), FrameError> {
    let Value::Array(items) = serde_json::from_str::<Value>(text)? else {
        return Err(FrameError::NotAnArray);
    };
    let kind = match items.first() {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => return Err(FrameError::UnknownType(other.to_string())),
        None => return Err(FrameError::NotAnArray),
    };
    Ok((kind, items))
}

fn expect_arity(frame: &'static str, items: &[Value], expected: usize) -> Result<(), FrameError> {
    if items.len() == expected {
        Ok(())
    } else {
        Err(FrameError::Arity {
            frame,
            expected,
            actual: items.len(),
        })
    }
}

fn string_at(frame: &'static str, field: &'static str, value: &Value) -> Result<String, FrameError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| FrameError::InvalidField {
            frame,
            field,
            reason: "expected string".to_string(),
        })
}

fn envelope_at(frame: &'static str, value: &Value) -> Result<Envelope, FrameError> {
    serde_json::from_value(value.clone()).map_err(|e| FrameError::InvalidField {
        frame,
        field: "envelope",
        reason: e.to_string(),
    })
}
