//! Configuration for the relay pool, health monitor, retry policy and sync.
//!
//! Every section has sensible defaults; a config can be built in code with
//! the `with_*` methods or loaded from JSON.
//!
//! # Example
//!
//! ```
//! use courier_core::config::CourierConfig;
//!
//! let config = CourierConfig::default()
//!     .with_relay("wss://relay.damus.io")
//!     .with_relay("wss://nos.lol");
//! assert!(config.validate().is_ok());
//!
//! let json = r#"{ "pool": { "relay_urls": ["wss://nos.lol"] } }"#;
//! let loaded = CourierConfig::from_json(json).unwrap();
//! assert_eq!(loaded.retry.max_retries, 5);
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum plaintext length, in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 10_000;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The JSON could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// How long the breaker stays open.
    pub open_duration_ms: u64,
    /// Connection attempts allowed while half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 60_000,
            half_open_max_attempts: 3,
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay.
    pub max_delay_ms: u64,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Maximum random spread applied to scheduled delays, as a fraction
    /// (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Returns `min(max_delay, initial_delay * multiplier^attempt)` in ms.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(64) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }

    /// Spreads `delay_ms` randomly by up to `jitter` in either direction.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn jittered(&self, delay_ms: u64) -> Duration {
        if self.jitter <= 0.0 || delay_ms == 0 {
            return Duration::from_millis(delay_ms);
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((delay_ms as f64 * factor).max(0.0) as u64)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Rolling latency above which a relay is at best degraded.
    pub degraded_latency_ms: u64,
    /// Smoothing factor for the rolling latency average (0..=1).
    pub latency_smoothing: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            backoff: BackoffConfig::default(),
            degraded_latency_ms: 2_000,
            latency_smoothing: 0.3,
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Relays to connect to.
    pub relay_urls: Vec<String>,
    /// Upper bound on a single relay's send.
    pub publish_timeout_ms: u64,
    /// Allows plaintext `ws://` relays. Only for local development.
    pub allow_insecure: bool,
    /// Outbound frames buffered per connection.
    pub outbound_buffer: usize,
    /// Inbound frames buffered per listener before frames are dropped.
    pub listener_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay_urls: Vec::new(),
            publish_timeout_ms: 10_000,
            allow_insecure: false,
            outbound_buffer: 256,
            listener_buffer: 1_024,
        }
    }
}

impl PoolConfig {
    /// Returns the per-relay publish bound.
    #[must_use]
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Outgoing message retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt before a message is failed.
    pub max_retries: u32,
    /// Retry schedule; same formula as connection backoff.
    pub backoff: BackoffConfig,
    /// Interval of the background retry sweep; 0 disables it.
    pub sweep_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffConfig {
                initial_delay_ms: 2_000,
                max_delay_ms: 300_000,
                multiplier: 2.0,
                jitter: 0.0,
            },
            sweep_interval_ms: 5_000,
        }
    }
}

/// Missed-message synchronization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum envelopes requested per relay.
    pub limit: u32,
    /// How long to wait for EOSE before a sync is considered done.
    pub timeout_ms: u64,
    /// Whether a sync starts automatically when a relay connects.
    pub on_connect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            limit: 500,
            timeout_ms: 15_000,
            on_connect: true,
        }
    }
}

impl SyncConfig {
    /// Returns how long a sync may wait for EOSE.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Health monitor settings.
    pub health: HealthConfig,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Retry policy for outgoing messages.
    pub retry: RetryPolicy,
    /// Gap sync settings.
    pub sync: SyncConfig,
    /// Maximum plaintext length in characters.
    pub max_content_length: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            sync: SyncConfig::default(),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

impl CourierConfig {
    /// Parses a config from JSON; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a value is invalid.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Adds a relay URL.
    #[must_use]
    pub fn with_relay(mut self, url: &str) -> Self {
        self.pool.relay_urls.push(url.to_string());
        self
    }

    /// Replaces the relay URL list.
    #[must_use]
    pub fn with_relays<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pool.relay_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Allows plaintext `ws://` relays.
    #[must_use]
    pub const fn with_insecure_relays(mut self, allow: bool) -> Self {
        self.pool.allow_insecure = allow;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the health monitor settings.
    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Sets the gap sync settings.
    #[must_use]
    pub const fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the maximum plaintext length.
    #[must_use]
    pub const fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cb = &self.health.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(invalid("health.circuit_breaker.failure_threshold", "must be > 0"));
        }
        if cb.success_threshold == 0 {
            return Err(invalid("health.circuit_breaker.success_threshold", "must be > 0"));
        }
        if cb.half_open_max_attempts == 0 {
            return Err(invalid(
                "health.circuit_breaker.half_open_max_attempts",
                "must be > 0",
            ));
        }
        validate_backoff("health.backoff", &self.health.backoff)?;
        validate_backoff("retry.backoff", &self.retry.backoff)?;
        if !(0.0..=1.0).contains(&self.health.latency_smoothing) {
            return Err(invalid("health.latency_smoothing", "must be within 0..=1"));
        }
        if self.pool.outbound_buffer == 0 {
            return Err(invalid("pool.outbound_buffer", "must be > 0"));
        }
        if self.pool.listener_buffer == 0 {
            return Err(invalid("pool.listener_buffer", "must be > 0"));
        }
        if self.max_content_length == 0 {
            return Err(invalid("max_content_length", "must be > 0"));
        }
        Ok(())
    }
}

fn validate_backoff(field: &'static str, backoff: &BackoffConfig) -> Result<(), ConfigError> {
    if backoff.initial_delay_ms == 0 || backoff.initial_delay_ms > backoff.max_delay_ms {
        return Err(invalid(field, "initial_delay_ms must be within 1..=max_delay_ms"));
    }
    if backoff.multiplier < 1.0 {
        return Err(invalid(field, "multiplier must be >= 1"));
    }
    if !(0.0..1.0).contains(&backoff.jitter) {
        return Err(invalid(field, "jitter must be within 0..1"));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
