//! Per-relay health state machine.
//!
//! Every mutation goes through [`HealthMonitor::update`], which holds the map
//! lock for the whole read-modify-write of one URL's metrics. Concurrent
//! open/error/close events for the same relay therefore never lose updates.
//!
//! Only [`HealthMonitor::initialize_relay`] creates metrics. Outcomes
//! reported for a URL that is not tracked, such as a late event from a
//! relay that was just removed, are ignored.

// Map operations hold the lock for the whole update.
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use super::types::{CircuitState, HealthStatus, RelayHealthMetrics};
use crate::clock::{Clock, SystemClock};
use crate::config::HealthConfig;

/// Tracks connection health and circuit breaker state for each relay URL.
///
/// # Example
///
/// ```
/// use courier_core::config::HealthConfig;
/// use courier_core::health::{CircuitState, HealthMonitor};
///
/// let monitor = HealthMonitor::new(HealthConfig::default());
/// monitor.initialize_relay("wss://relay.example.com");
///
/// for _ in 0..5 {
///     monitor.record_connection_failure("wss://relay.example.com", Some("refused"));
/// }
///
/// let metrics = monitor.get_metrics("wss://relay.example.com").unwrap();
/// assert_eq!(metrics.circuit_breaker_state, CircuitState::Open);
/// assert!(!monitor.can_connect("wss://relay.example.com"));
/// ```
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    relays: Mutex<HashMap<String, RelayHealthMetrics>>,
}

impl HealthMonitor {
    /// Creates a monitor using the system clock.
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a monitor with an explicit clock.
    #[must_use]
    pub fn with_clock(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the monitor's configuration.
    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Starts tracking `url` with fresh metrics, replacing any existing entry.
    pub fn initialize_relay(&self, url: &str) {
        let now = self.clock.now();
        let fresh = RelayHealthMetrics::new(url, self.config.backoff.initial_delay_ms, now);
        self.lock().insert(url.to_string(), fresh);
    }

    /// Stops tracking `url`.
    pub fn remove_relay(&self, url: &str) {
        self.lock().remove(url);
    }

    /// Drops every tracked relay.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Records the start of a connection attempt.
    pub fn record_connection_attempt(&self, url: &str) {
        self.update(url, |metrics, _, _| {
            metrics.connection_attempts += 1;
            if metrics.circuit_breaker_state == CircuitState::HalfOpen {
                metrics.half_open_attempts += 1;
            }
        });
    }

    /// Records a connection that opened.
    ///
    /// Resets backoff; in half-open, enough consecutive successes close the
    /// circuit.
    pub fn record_connection_success(&self, url: &str) {
        self.update(url, |metrics, config, now| {
            metrics.successful_connections += 1;
            metrics.consecutive_failures = 0;
            metrics.retry_count = 0;
            metrics.backoff_delay_ms = config.backoff.initial_delay_ms;
            metrics.next_retry_at = None;
            metrics.last_error = None;
            metrics.last_connected_at = Some(now);

            if metrics.circuit_breaker_state == CircuitState::Open {
                metrics.circuit_breaker_state = CircuitState::HalfOpen;
                metrics.consecutive_successes = 0;
            }

            if metrics.circuit_breaker_state == CircuitState::HalfOpen {
                metrics.consecutive_successes += 1;
                if metrics.consecutive_successes >= config.circuit_breaker.success_threshold {
                    info!(relay = %metrics.url, "circuit breaker closed");
                    metrics.circuit_breaker_state = CircuitState::Closed;
                    metrics.consecutive_successes = 0;
                    metrics.half_open_attempts = 0;
                }
            }
        });
    }

    /// Records a failed connection or a transport error.
    ///
    /// Returns the updated metrics so the caller can schedule the retry, or
    /// `None` if `url` is not tracked.
    pub fn record_connection_failure(
        &self,
        url: &str,
        error: Option<&str>,
    ) -> Option<RelayHealthMetrics> {
        self.update(url, |metrics, config, now| {
            metrics.failed_connections += 1;
            metrics.consecutive_successes = 0;
            metrics.last_error = error.map(str::to_string);
            metrics.backoff_delay_ms = config.backoff.delay_ms(metrics.retry_count);
            metrics.retry_count = metrics.retry_count.saturating_add(1);

            let open_until = now + chrono_millis(config.circuit_breaker.open_duration_ms);
            match metrics.circuit_breaker_state {
                CircuitState::Closed => {
                    metrics.consecutive_failures += 1;
                    if metrics.consecutive_failures >= config.circuit_breaker.failure_threshold {
                        warn!(
                            relay = %metrics.url,
                            failures = metrics.consecutive_failures,
                            "circuit breaker opened"
                        );
                        metrics.circuit_breaker_state = CircuitState::Open;
                        metrics.next_retry_at = Some(open_until);
                    } else {
                        metrics.next_retry_at =
                            Some(now + chrono_millis(metrics.backoff_delay_ms));
                    }
                }
                CircuitState::HalfOpen | CircuitState::Open => {
                    warn!(relay = %metrics.url, "circuit breaker re-opened");
                    metrics.circuit_breaker_state = CircuitState::Open;
                    metrics.half_open_attempts = 0;
                    metrics.next_retry_at = Some(open_until);
                }
            }
            metrics.clone()
        })
    }

    /// Records a clean close of an open connection.
    pub fn record_disconnection(&self, url: &str) {
        self.update(url, |metrics, _, now| {
            metrics.last_disconnected_at = Some(now);
        });
    }

    /// Folds a latency sample into the rolling average.
    pub fn record_latency(&self, url: &str, latency_ms: f64) {
        self.update(url, |metrics, config, _| {
            let alpha = config.latency_smoothing;
            metrics.latency_ms = Some(match metrics.latency_ms {
                Some(previous) => previous.mul_add(1.0 - alpha, latency_ms * alpha),
                None => latency_ms,
            });
        });
    }

    /// Records that a publish was handed to this relay.
    pub fn record_publish_success(&self, url: &str) {
        self.update(url, |metrics, _, _| metrics.publish_successes += 1);
    }

    /// Records that a publish failed on this relay.
    pub fn record_publish_failure(&self, url: &str, error: Option<&str>) {
        self.update(url, |metrics, _, _| {
            metrics.publish_failures += 1;
            if let Some(error) = error {
                metrics.last_error = Some(error.to_string());
            }
        });
    }

    /// Returns whether a connection attempt is allowed right now.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here.
    /// Untracked URLs are refused.
    pub fn can_connect(&self, url: &str) -> bool {
        let allowed = self.update(url, |metrics, config, now| match metrics.circuit_breaker_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if metrics.next_retry_at.is_none_or(|at| now >= at) {
                    debug!(relay = %metrics.url, "circuit breaker half-open");
                    metrics.circuit_breaker_state = CircuitState::HalfOpen;
                    metrics.half_open_attempts = 0;
                    metrics.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                metrics.half_open_attempts < config.circuit_breaker.half_open_max_attempts
            }
        });
        allowed.unwrap_or(false)
    }

    /// How long to wait before the next reconnection attempt.
    ///
    /// While the circuit is open this is the remaining cooldown; otherwise
    /// it is the backoff delay with jitter applied.
    #[must_use]
    pub fn retry_delay(&self, url: &str) -> Duration {
        let now = self.clock.now();
        let Some(metrics) = self.get_metrics(url) else {
            return Duration::from_millis(self.config.backoff.initial_delay_ms);
        };

        if metrics.circuit_breaker_state == CircuitState::Open {
            return metrics
                .next_retry_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or_default();
        }

        self.config.backoff.jittered(metrics.backoff_delay_ms)
    }

    /// Returns a snapshot of the metrics for `url`.
    #[must_use]
    pub fn get_metrics(&self, url: &str) -> Option<RelayHealthMetrics> {
        self.lock().get(url).cloned()
    }

    /// Returns snapshots for every tracked relay.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<RelayHealthMetrics> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        all
    }

    /// Returns the health classification for `url`.
    #[must_use]
    pub fn get_health_status(&self, url: &str) -> HealthStatus {
        self.lock()
            .get(url)
            .map_or(HealthStatus::Unknown, |metrics| metrics.status)
    }

    /// Returns the priority score for `url` (0 when untracked).
    #[must_use]
    pub fn health_score(&self, url: &str) -> u8 {
        self.get_health_status(url).score()
    }

    /// Applies `f` to the metrics for `url` atomically, then recomputes the
    /// derived fields. Returns `None` without calling `f` if `url` is not
    /// tracked.
    fn update<R>(
        &self,
        url: &str,
        f: impl FnOnce(&mut RelayHealthMetrics, &HealthConfig, DateTime<Utc>) -> R,
    ) -> Option<R> {
        let now = self.clock.now();
        let mut relays = self.lock();
        let Some(metrics) = relays.get_mut(url) else {
            trace!(relay = url, "ignoring outcome for untracked relay");
            return None;
        };

        let result = f(metrics, &self.config, now);

        metrics.success_rate = success_rate(metrics);
        metrics.status = derive_status(metrics, &self.config);
        metrics.updated_at = now;
        Some(result)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RelayHealthMetrics>> {
        self.relays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("relays", &self.lock().len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn success_rate(metrics: &RelayHealthMetrics) -> f64 {
    let total = metrics.total_outcomes();
    if total == 0 {
        return 0.0;
    }
    let successes = metrics.successful_connections + metrics.publish_successes;
    successes as f64 / total as f64 * 100.0
}

#[allow(clippy::cast_precision_loss)]
fn derive_status(metrics: &RelayHealthMetrics, config: &HealthConfig) -> HealthStatus {
    match metrics.circuit_breaker_state {
        CircuitState::Open => HealthStatus::Unhealthy,
        CircuitState::HalfOpen => HealthStatus::Degraded,
        CircuitState::Closed => {
            if metrics.total_outcomes() == 0 {
                HealthStatus::Unknown
            } else if metrics.success_rate >= 80.0 {
                let slow = metrics
                    .latency_ms
                    .is_some_and(|ms| ms > config.degraded_latency_ms as f64);
                if slow {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            } else if metrics.success_rate >= 50.0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            }
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn chrono_millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.min(i64::MAX as u64) as i64)
}
