//! Local message records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::QueueError;
use crate::envelope::Envelope;
use crate::relay::RelayResult;

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the local identity.
    Outgoing,
    /// Received from a peer.
    Incoming,
}

impl Direction {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

impl FromStr for Direction {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outgoing" => Ok(Self::Outgoing),
            "incoming" => Ok(Self::Incoming),
            other => Err(QueueError::InvalidData(format!("unknown direction: {other}"))),
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Signed and being published.
    Sending,
    /// At least one relay took the envelope.
    Accepted,
    /// Every relay refused it with a permanent reason.
    Rejected,
    /// Waiting in the retry queue.
    Queued,
    /// Retries exhausted.
    Failed,
    /// Received and admitted.
    Delivered,
}

impl MessageStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Queued => "queued",
            Self::Failed => "failed",
            Self::Delivered => "delivered",
        }
    }

    /// Returns true if no further delivery attempt will happen on its own.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Rejected | Self::Failed | Self::Delivered)
    }
}

impl FromStr for MessageStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "queued" => Ok(Self::Queued),
            "failed" => Ok(Self::Failed),
            "delivered" => Ok(Self::Delivered),
            other => Err(QueueError::InvalidData(format!("unknown status: {other}"))),
        }
    }
}

/// A locally persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Envelope id.
    pub id: String,
    /// Stable id of the two-party conversation.
    pub conversation_id: String,
    /// Sender public key (hex).
    pub sender_key: String,
    /// Recipient public key (hex).
    pub recipient_key: String,
    /// Decrypted content.
    pub plaintext: String,
    /// Envelope creation time (Unix seconds).
    pub timestamp: i64,
    /// Outgoing or incoming.
    pub direction: Direction,
    /// Delivery status.
    pub status: MessageStatus,
    /// Per-relay outcomes of the latest publish attempt.
    pub relay_results: Vec<RelayResult>,
    /// Retries scheduled so far.
    pub retry_count: u32,
    /// When the next retry is due, while queued.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// The signed envelope, kept for outgoing messages so every retry
    /// republishes the identical envelope.
    pub envelope: Option<Envelope>,
}

impl Message {
    /// Builds the record for an envelope the local identity just signed.
    #[must_use]
    pub fn outgoing(envelope: &Envelope, recipient_key: &str, plaintext: &str) -> Self {
        Self {
            id: envelope.id.clone(),
            conversation_id: conversation_id(&envelope.sender_key, recipient_key),
            sender_key: envelope.sender_key.clone(),
            recipient_key: recipient_key.to_string(),
            plaintext: plaintext.to_string(),
            timestamp: envelope.created_at,
            direction: Direction::Outgoing,
            status: MessageStatus::Sending,
            relay_results: Vec::new(),
            retry_count: 0,
            next_retry_at: None,
            envelope: Some(envelope.clone()),
        }
    }

    /// Builds the record for an admitted envelope addressed to `local_key`.
    #[must_use]
    pub fn incoming(envelope: &Envelope, local_key: &str, plaintext: String) -> Self {
        Self {
            id: envelope.id.clone(),
            conversation_id: conversation_id(&envelope.sender_key, local_key),
            sender_key: envelope.sender_key.clone(),
            recipient_key: local_key.to_string(),
            plaintext,
            timestamp: envelope.created_at,
            direction: Direction::Incoming,
            status: MessageStatus::Delivered,
            relay_results: Vec::new(),
            retry_count: 0,
            next_retry_at: None,
            envelope: None,
        }
    }

    /// Returns the other party's key.
    #[must_use]
    pub fn peer_key(&self) -> &str {
        match self.direction {
            Direction::Outgoing => &self.recipient_key,
            Direction::Incoming => &self.sender_key,
        }
    }

    /// Returns the number of relays that took the latest attempt.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.relay_results.iter().filter(|r| r.success).count()
    }
}

/// A pending entry in the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// The queued message.
    pub message_id: String,
    /// Retries scheduled so far.
    pub retry_count: u32,
    /// When the retry is due.
    pub next_retry_at: DateTime<Utc>,
}

/// Returns the conversation id for two keys.
///
/// SHA256 (hex) of the two keys sorted and joined with `:`, so both
/// parties derive the same id.
#[must_use]
pub fn conversation_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b":");
    hasher.update(second.as_bytes());
    hex::encode(hasher.finalize())
}
