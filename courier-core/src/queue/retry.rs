//! Retry eligibility and scheduling for outgoing messages.
//!
//! A message gets one initial publish attempt plus up to
//! [`RetryPolicy::max_retries`] retries. Each scheduled retry increments
//! `retry_count`; once it reaches the limit the message is `failed` and
//! leaves the queue for good.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::error::Result;
use super::storage::MessageStorage;
use super::types::{Direction, Message, MessageStatus, RetryEntry};
use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::health::HealthMonitor;

/// Whether a message should be retried, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// True while the retry budget is not exhausted.
    pub should_retry: bool,
    /// When the retry is due, if it should happen.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Decides when failed sends are retried and keeps the retry queue.
pub struct RetryManager {
    policy: RetryPolicy,
    storage: Arc<MessageStorage>,
    health: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
}

impl RetryManager {
    /// Creates a retry manager.
    #[must_use]
    pub fn new(
        policy: RetryPolicy,
        storage: Arc<MessageStorage>,
        health: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            storage,
            health,
            clock,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the un-jittered delay before retry number `retry_count + 1`.
    #[must_use]
    pub fn calculate_next_retry(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.policy.backoff.delay_ms(retry_count))
    }

    /// Decides whether `message` gets another attempt.
    #[must_use]
    pub fn should_retry(&self, message: &Message) -> RetryDecision {
        if message.retry_count >= self.policy.max_retries {
            return RetryDecision {
                should_retry: false,
                next_retry_at: None,
            };
        }

        let base_ms = self.policy.backoff.delay_ms(message.retry_count);
        let delay = self.policy.backoff.jittered(base_ms);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        let now = self.clock.now();
        RetryDecision {
            should_retry: true,
            next_retry_at: Some(now.checked_add_signed(delay).unwrap_or(now)),
        }
    }

    /// Queues `message` for an attempt as soon as a relay is available.
    ///
    /// Used when nothing could be attempted at all, so no retry is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn queue_outgoing_message(&self, message: &mut Message) -> Result<()> {
        let now = self.clock.now();
        message.status = MessageStatus::Queued;
        message.next_retry_at = Some(now);
        self.storage.save_message(message)?;
        self.storage.upsert_retry_entry(&RetryEntry {
            message_id: message.id.clone(),
            retry_count: message.retry_count,
            next_retry_at: now,
        })?;
        debug!(message = %message.id, "queued until a relay is available");
        Ok(())
    }

    /// Queues every outgoing message still marked `sending`.
    ///
    /// Such a row was interrupted mid-publish and has no retry entry. It is
    /// queued due now without spending a retry. Returns how many were
    /// requeued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut message in self.storage.messages_by_status(MessageStatus::Sending)? {
            if message.direction != Direction::Outgoing {
                continue;
            }
            self.queue_outgoing_message(&mut message)?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "requeued interrupted sends");
        }
        Ok(recovered)
    }

    /// Applies [`should_retry`](Self::should_retry) after a failed attempt.
    ///
    /// An eligible message is queued with its retry count incremented; an
    /// exhausted one becomes `failed` and leaves the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn schedule_retry(&self, message: &mut Message) -> Result<RetryDecision> {
        let decision = self.should_retry(message);

        match decision.next_retry_at {
            Some(next_retry_at) if decision.should_retry => {
                message.retry_count += 1;
                message.status = MessageStatus::Queued;
                message.next_retry_at = Some(next_retry_at);
                self.storage.save_message(message)?;
                self.storage.upsert_retry_entry(&RetryEntry {
                    message_id: message.id.clone(),
                    retry_count: message.retry_count,
                    next_retry_at,
                })?;
                info!(
                    message = %message.id,
                    retry = message.retry_count,
                    max = self.policy.max_retries,
                    %next_retry_at,
                    "retry scheduled"
                );
            }
            _ => {
                message.status = MessageStatus::Failed;
                message.next_retry_at = None;
                self.storage.save_message(message)?;
                self.storage.remove_retry_entry(&message.id)?;
                warn!(
                    message = %message.id,
                    retries = message.retry_count,
                    "retries exhausted, message failed"
                );
            }
        }

        Ok(decision)
    }

    /// Returns every queued message, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_queued_messages(&self) -> Result<Vec<Message>> {
        self.resolve(self.storage.retry_entries()?)
    }

    /// Returns the queued messages due at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        self.resolve(self.storage.due_retry_entries(now)?)
    }

    /// Removes a message from the queue.
    ///
    /// Returns true if it was queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove_from_queue(&self, message_id: &str) -> Result<bool> {
        self.storage.remove_retry_entry(message_id)
    }

    /// Returns the number of queued messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn queue_len(&self) -> Result<usize> {
        self.storage.retry_queue_len()
    }

    /// Records that a relay took a publish.
    pub fn record_relay_success(&self, url: &str) {
        self.health.record_publish_success(url);
    }

    /// Records that a relay failed or refused a publish.
    pub fn record_relay_failure(&self, url: &str, error: Option<&str>) {
        self.health.record_publish_failure(url, error);
    }

    fn resolve(&self, entries: Vec<RetryEntry>) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.storage.get_message(&entry.message_id)? {
                Some(message) => messages.push(message),
                None => {
                    warn!(message = %entry.message_id, "dropping retry entry without message");
                    self.storage.remove_retry_entry(&entry.message_id)?;
                }
            }
        }
        Ok(messages)
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
