//! Types for relay health tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall health classification of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Connects reliably with acceptable latency.
    Healthy,
    /// Intermittent failures, high latency, or recovering from an open circuit.
    Degraded,
    /// Mostly failing, or the circuit is open.
    Unhealthy,
    /// No outcomes recorded yet.
    Unknown,
}

impl HealthStatus {
    /// Priority score used to order relays for publishing.
    ///
    /// Higher is better. The score only orders relays; it never excludes one.
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            Self::Healthy => 3,
            Self::Degraded => 2,
            Self::Unhealthy => 1,
            Self::Unknown => 0,
        }
    }

    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Connection attempts are refused until the cooldown elapses.
    Open,
    /// A limited number of trial connections are allowed.
    HalfOpen,
}

impl CircuitState {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Health metrics for a single relay URL.
///
/// Owned by the [`HealthMonitor`](super::HealthMonitor); everyone else only
/// sees cloned snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHealthMetrics {
    /// The relay URL.
    pub url: String,
    /// Derived health classification.
    pub status: HealthStatus,
    /// Connection attempts started.
    pub connection_attempts: u64,
    /// Connections that opened.
    pub successful_connections: u64,
    /// Connections that failed or errored.
    pub failed_connections: u64,
    /// Publishes handed to this relay successfully.
    pub publish_successes: u64,
    /// Publishes that failed on this relay.
    pub publish_failures: u64,
    /// Rolling average latency in milliseconds.
    pub latency_ms: Option<f64>,
    /// Success rate over all recorded outcomes, 0–100.
    pub success_rate: f64,
    /// Circuit breaker state.
    pub circuit_breaker_state: CircuitState,
    /// Failures since the last successful connection.
    pub retry_count: u32,
    /// Earliest time a reconnection should be attempted.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Current backoff delay.
    pub backoff_delay_ms: u64,
    /// Consecutive failures while closed.
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open.
    pub consecutive_successes: u32,
    /// Attempts made in the current half-open window.
    pub half_open_attempts: u32,
    /// Most recent failure reason.
    pub last_error: Option<String>,
    /// Last time a connection opened.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last time the connection closed.
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// Last time these metrics changed.
    pub updated_at: DateTime<Utc>,
}

impl RelayHealthMetrics {
    /// Creates empty metrics for `url`.
    #[must_use]
    pub fn new(url: &str, initial_backoff_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            url: url.to_string(),
            status: HealthStatus::Unknown,
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
            publish_successes: 0,
            publish_failures: 0,
            latency_ms: None,
            success_rate: 0.0,
            circuit_breaker_state: CircuitState::Closed,
            retry_count: 0,
            next_retry_at: None,
            backoff_delay_ms: initial_backoff_ms,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_attempts: 0,
            last_error: None,
            last_connected_at: None,
            last_disconnected_at: None,
            updated_at: now,
        }
    }

    /// Total recorded outcomes (connections and publishes).
    #[must_use]
    pub const fn total_outcomes(&self) -> u64 {
        self.successful_connections
            + self.failed_connections
            + self.publish_successes
            + self.publish_failures
    }

    /// Health score of the current status.
    #[must_use]
    pub const fn score(&self) -> u8 {
        self.status.score()
    }
}
