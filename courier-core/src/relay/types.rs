//! Types for relay management.
//!
//! This module defines connection status, per-relay publish results and
//! subscription records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::frame::{Filter, RelayMessage};

/// Connection status for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and ready.
    Open,
    /// The connection closed.
    Closed,
    /// The connection failed.
    Error,
}

impl ConnectionStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

/// Status of a single relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConnection {
    /// The relay URL.
    pub url: String,
    /// Current connection status.
    pub status: ConnectionStatus,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
    /// The last error, for `Error` status.
    pub error_message: Option<String>,
}

impl RelayConnection {
    /// Creates a connection record in `Connecting` state.
    #[must_use]
    pub fn connecting(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: ConnectionStatus::Connecting,
            updated_at: Utc::now(),
            error_message: None,
        }
    }

    /// Moves to `status`, recording `error` if given.
    pub fn transition(&mut self, status: ConnectionStatus, error: Option<String>) {
        self.status = status;
        self.error_message = error;
        self.updated_at = Utc::now();
    }

    /// Returns true if the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open
    }
}

/// Outcome of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResult {
    /// The relay URL.
    pub relay_url: String,
    /// Whether the relay took the envelope.
    pub success: bool,
    /// Failure or rejection reason.
    pub error: Option<String>,
    /// Local send overhead in milliseconds.
    pub latency_ms: Option<u64>,
}

impl RelayResult {
    /// A successful result.
    #[must_use]
    pub fn accepted(relay_url: &str, latency_ms: Option<u64>) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            success: true,
            error: None,
            latency_ms,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(relay_url: &str, error: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            success: false,
            error: Some(error.into()),
            latency_ms: None,
        }
    }
}

/// Result of fanning out one payload to every open relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiRelayPublishResult {
    /// One entry per attempted relay, ordered by descending health score.
    pub results: Vec<RelayResult>,
}

impl MultiRelayPublishResult {
    /// Returns true if at least one relay accepted the payload.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().any(|r| r.success)
    }

    /// Returns the number of successful relays.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Returns the number of failed relays.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    /// Returns the total number of relays attempted.
    #[must_use]
    pub fn total_attempted(&self) -> usize {
        self.results.len()
    }
}

/// A REQ subscription the pool keeps issued on every open relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription id used in REQ/EVENT/EOSE/CLOSE frames.
    pub id: String,
    /// The filter sent with the REQ.
    pub filter: Filter,
    /// Whether the subscription is re-issued on (re)connection.
    pub is_active: bool,
}

/// A parsed frame together with the relay it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// The relay that sent the frame.
    pub relay_url: String,
    /// The parsed frame.
    pub message: RelayMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_strings() {
        assert_eq!(ConnectionStatus::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionStatus::Open.as_str(), "open");
        assert_eq!(ConnectionStatus::Closed.as_str(), "closed");
        assert_eq!(ConnectionStatus::Error.as_str(), "error");
    }

    #[test]
    fn transition_records_error() {
        let mut connection = RelayConnection::connecting("wss://a.example");
        assert!(!connection.is_open());
        connection.transition(ConnectionStatus::Error, Some("refused".to_string()));
        assert_eq!(connection.status, ConnectionStatus::Error);
        assert_eq!(connection.error_message.as_deref(), Some("refused"));
        connection.transition(ConnectionStatus::Open, None);
        assert!(connection.is_open());
        assert!(connection.error_message.is_none());
    }

    #[test]
    fn publish_result_counts() {
        let result = MultiRelayPublishResult {
            results: vec![
                RelayResult::accepted("wss://a.example", Some(3)),
                RelayResult::failed("wss://b.example", "blocked"),
            ],
        };
        assert!(result.is_success());
        assert_eq!(result.success_count(), 1);
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.total_attempted(), 2);
    }

    #[test]
    fn publish_result_not_success_when_all_fail() {
        let result = MultiRelayPublishResult {
            results: vec![RelayResult::failed("wss://a.example", "timeout")],
        };
        assert!(!result.is_success());
        assert!(!MultiRelayPublishResult::default().is_success());
    }

    #[test]
    fn relay_result_serializes() {
        let result = RelayResult::failed("wss://a.example", "blocked");
        let json = serde_json::to_string(&result).unwrap();
        let back: RelayResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
