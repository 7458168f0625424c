//! The outgoing path: encrypt, sign, persist, publish, reduce.
//!
//! A publish succeeds per relay once the frame is on the relay's
//! connection. The relay's own verdict arrives later as an OK frame and is
//! folded into the same result batch by [`OutgoingPipeline::handle_ok`].
//! Verdicts that arrive while the publish is still settling are held back
//! and applied right after it, so no OK frame is lost or double-counted.
//! The view and state are updated before the verdict lock is released.

// Verdict bookkeeping holds the lock for the whole transition.
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::error::{DeliveryError, PipelineError, Result};
use super::{lock, PipelineContext};
use crate::crypto::parse_public_key;
use crate::envelope::UnsignedEnvelope;
use crate::queue::{Direction, Message, MessageStatus, RetryManager};
use crate::relay::{ClientMessage, RelayResult};

/// Rejection prefixes after which republishing cannot help.
const PERMANENT_REJECTIONS: [&str; 4] = ["invalid:", "blocked:", "restricted:", "pow:"];

/// A relay that already has the envelope reports it with this prefix.
const DUPLICATE_PREFIX: &str = "duplicate:";

/// Result of a send or republish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// True if at least one relay took the envelope.
    pub success: bool,
    /// The envelope id.
    pub message_id: String,
    /// Status after this attempt.
    pub status: MessageStatus,
    /// One entry per relay attempted.
    pub relay_results: Vec<RelayResult>,
    /// Why nothing reached a relay.
    pub error: Option<DeliveryError>,
}

impl SendOutcome {
    fn new(message: &Message, no_relays: bool) -> Self {
        let success = message.success_count() > 0;
        let error = if no_relays {
            Some(DeliveryError::NoRelaysConnected)
        } else if success {
            None
        } else {
            Some(DeliveryError::AllRelaysRejected)
        };
        Self {
            success,
            message_id: message.id.clone(),
            status: message.status,
            relay_results: message.relay_results.clone(),
            error,
        }
    }
}

#[derive(Debug, Clone)]
struct Verdict {
    relay_url: String,
    accepted: bool,
    reason: String,
}

/// Sends messages and tracks their delivery.
pub struct OutgoingPipeline {
    ctx: PipelineContext,
    retry: Arc<RetryManager>,
    max_content_length: usize,
    pending_verdicts: Mutex<HashMap<String, Vec<Verdict>>>,
    sweep: tokio::sync::Mutex<()>,
}

impl OutgoingPipeline {
    /// Creates the outgoing pipeline.
    #[must_use]
    pub fn new(ctx: PipelineContext, retry: Arc<RetryManager>, max_content_length: usize) -> Self {
        Self {
            ctx,
            retry,
            max_content_length,
            pending_verdicts: Mutex::new(HashMap::new()),
            sweep: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the retry manager.
    #[must_use]
    pub const fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    /// Encrypts `plaintext` for `recipient`, signs it and publishes it to
    /// every open relay.
    ///
    /// Relay-level failures are reported in the outcome; the message is
    /// persisted and queued or failed according to the retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input, crypto failures or storage
    /// failures. Nothing is persisted when validation, encryption or
    /// signing fails.
    pub async fn send(&self, recipient: &str, plaintext: &str) -> Result<SendOutcome> {
        let recipient = self.validate(recipient, plaintext)?;
        let ctx = &self.ctx;

        let ciphertext = ctx
            .crypto
            .encrypt(plaintext, &recipient, &ctx.identity)
            .await?;
        let unsigned =
            UnsignedEnvelope::direct_message(&ctx.identity.pubkey_hex(), &recipient, ciphertext)
                .with_created_at(ctx.clock.now().timestamp());
        let signature = ctx.crypto.sign(&unsigned, &ctx.identity).await?;
        let envelope = unsigned.into_signed(signature)?;

        let message = Message::outgoing(&envelope, &recipient, plaintext);
        ctx.storage.save_message(&message)?;
        self.commit(&message);
        debug!(message = %message.id, "message signed and stored");

        self.deliver(message).await
    }

    /// Republishes a failed, rejected or queued message now.
    ///
    /// A failed or rejected message gets a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MessageNotFound`] for an unknown id and
    /// [`PipelineError::NotRetryable`] for an incoming message or one that
    /// is sending or accepted.
    pub async fn retry_failed_message(&self, id: &str) -> Result<SendOutcome> {
        let _sweep = self.sweep.lock().await;
        let mut message = self
            .ctx
            .storage
            .get_message(id)?
            .ok_or_else(|| PipelineError::MessageNotFound(id.to_string()))?;

        let retryable = matches!(
            message.status,
            MessageStatus::Failed | MessageStatus::Rejected | MessageStatus::Queued
        );
        if message.direction != Direction::Outgoing || !retryable {
            return Err(PipelineError::not_retryable(id, message.status));
        }
        if message.status != MessageStatus::Queued {
            message.retry_count = 0;
        }
        info!(message = id, "manual retry");
        self.deliver(message).await
    }

    /// Republishes every queued message that is due.
    ///
    /// Does nothing while no relay is open or while another sweep runs.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn process_retry_queue(&self) -> Result<Vec<SendOutcome>> {
        let Ok(_sweep) = self.sweep.try_lock() else {
            debug!("retry sweep already running");
            return Ok(Vec::new());
        };
        if self.ctx.pool.open_count() == 0 {
            return Ok(Vec::new());
        }

        let due = self.retry.get_due_messages(self.ctx.clock.now())?;
        let mut outcomes = Vec::with_capacity(due.len());
        for message in due {
            if self.ctx.pool.open_count() == 0 {
                break;
            }
            let pending = matches!(message.status, MessageStatus::Queued | MessageStatus::Sending);
            if message.direction != Direction::Outgoing || !pending {
                self.retry.remove_from_queue(&message.id)?;
                continue;
            }
            outcomes.push(self.deliver(message).await?);
        }

        if !outcomes.is_empty() {
            info!(
                attempted = outcomes.len(),
                accepted = outcomes.iter().filter(|o| o.success).count(),
                "retry sweep finished"
            );
        }
        Ok(outcomes)
    }

    /// Folds a relay's OK frame into the message it refers to.
    ///
    /// `duplicate:` refusals count as acceptance. Frames for unknown or
    /// incoming ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn handle_ok(
        &self,
        relay_url: &str,
        event_id: &str,
        accepted: bool,
        reason: &str,
    ) -> Result<()> {
        let verdict = Verdict {
            relay_url: relay_url.to_string(),
            accepted,
            reason: reason.to_string(),
        };

        let mut pending = lock(&self.pending_verdicts);
        let Some(mut message) = self.ctx.storage.get_message(event_id)? else {
            debug!(relay = relay_url, event = event_id, "OK for unknown event");
            return Ok(());
        };
        if message.direction != Direction::Outgoing {
            return Ok(());
        }
        if message.status == MessageStatus::Sending {
            pending.entry(message.id.clone()).or_default().push(verdict);
            return Ok(());
        }

        self.apply_verdict(&mut message, &verdict)?;
        self.commit(&message);
        drop(pending);
        Ok(())
    }

    fn validate(&self, recipient: &str, plaintext: &str) -> Result<String> {
        if !self.ctx.crypto.is_valid_public_key(recipient) {
            return Err(PipelineError::InvalidRecipientKey(recipient.to_string()));
        }
        let recipient = parse_public_key(recipient)?.to_hex();

        if plaintext.trim().is_empty() {
            return Err(PipelineError::Validation(
                "Message cannot be empty".to_string(),
            ));
        }
        let length = plaintext.chars().count();
        if length > self.max_content_length {
            return Err(PipelineError::Validation(format!(
                "Message is {length} characters; the limit is {}",
                self.max_content_length
            )));
        }
        Ok(recipient)
    }

    async fn deliver(&self, mut message: Message) -> Result<SendOutcome> {
        let Some(envelope) = message.envelope.clone() else {
            return Err(PipelineError::not_retryable(&message.id, message.status));
        };

        if self.ctx.pool.open_count() == 0 {
            return self.queue_without_relays(message);
        }

        let frame = ClientMessage::Event(Box::new(envelope)).to_json()?;
        message.status = MessageStatus::Sending;
        message.relay_results.clear();
        self.ctx.storage.save_message(&message)?;
        self.commit(&message);

        let published = self.ctx.pool.publish_to_all(&frame).await;

        let mut pending = lock(&self.pending_verdicts);
        let no_relays = published.total_attempted() == 0;
        let held_back = pending.remove(&message.id).unwrap_or_default();
        if let Err(e) =
            self.settle_publish(&mut message, no_relays, published.results, &held_back)
        {
            self.requeue_unsettled(&mut message, &e);
            self.commit(&message);
            return Err(e);
        }
        self.commit(&message);
        drop(pending);

        Ok(SendOutcome::new(&message, no_relays))
    }

    /// Folds a publish batch and any verdicts held back during it into
    /// `message`.
    fn settle_publish(
        &self,
        message: &mut Message,
        no_relays: bool,
        results: Vec<RelayResult>,
        held_back: &[Verdict],
    ) -> Result<()> {
        if no_relays {
            self.retry.queue_outgoing_message(message)?;
        } else {
            self.reduce(message, results)?;
        }
        for verdict in held_back {
            self.apply_verdict(message, verdict)?;
        }
        Ok(())
    }

    /// Puts a message whose publish could not be settled back in the queue
    /// so it is not left `sending`.
    fn requeue_unsettled(&self, message: &mut Message, cause: &PipelineError) {
        warn!(message = %message.id, error = %cause, "publish not settled, requeueing");
        if let Err(e) = self.retry.queue_outgoing_message(message) {
            warn!(
                message = %message.id,
                error = %e,
                "requeue failed, message stays sending until restart"
            );
            if let Ok(Some(stored)) = self.ctx.storage.get_message(&message.id) {
                *message = stored;
            }
        }
    }

    fn queue_without_relays(&self, mut message: Message) -> Result<SendOutcome> {
        message.relay_results.clear();
        self.retry.queue_outgoing_message(&mut message)?;
        self.commit(&message);
        warn!(message = %message.id, "no relays connected, message queued");
        Ok(SendOutcome::new(&message, true))
    }

    fn reduce(&self, message: &mut Message, results: Vec<RelayResult>) -> Result<()> {
        for result in &results {
            if result.success {
                self.retry.record_relay_success(&result.relay_url);
            } else {
                self.retry
                    .record_relay_failure(&result.relay_url, result.error.as_deref());
            }
        }
        message.relay_results = results;

        if message.success_count() > 0 {
            self.mark_accepted(message)?;
        } else {
            warn!(message = %message.id, "no relay took the message");
            self.retry.schedule_retry(message)?;
        }
        Ok(())
    }

    fn apply_verdict(&self, message: &mut Message, verdict: &Verdict) -> Result<()> {
        let accepted = verdict.accepted || verdict.reason.starts_with(DUPLICATE_PREFIX);
        let latency_ms = message
            .relay_results
            .iter()
            .find(|r| r.relay_url == verdict.relay_url)
            .and_then(|r| r.latency_ms);
        let result = if accepted {
            RelayResult::accepted(&verdict.relay_url, latency_ms)
        } else if verdict.reason.is_empty() {
            RelayResult::failed(&verdict.relay_url, "rejected")
        } else {
            RelayResult::failed(&verdict.relay_url, verdict.reason.clone())
        };
        match message
            .relay_results
            .iter_mut()
            .find(|r| r.relay_url == verdict.relay_url)
        {
            Some(existing) => *existing = result,
            None => message.relay_results.push(result),
        }

        let previous = message.status;
        if message.success_count() > 0 {
            if previous == MessageStatus::Accepted {
                self.ctx.storage.save_message(message)?;
            } else {
                self.mark_accepted(message)?;
            }
        } else if matches!(previous, MessageStatus::Sending | MessageStatus::Accepted) {
            if message.relay_results.iter().all(is_permanent_rejection) {
                message.status = MessageStatus::Rejected;
                message.next_retry_at = None;
                self.ctx.storage.save_message(message)?;
                self.retry.remove_from_queue(&message.id)?;
                warn!(message = %message.id, reason = %verdict.reason, "every relay rejected the message");
            } else {
                self.retry.schedule_retry(message)?;
            }
        } else {
            self.ctx.storage.save_message(message)?;
        }

        debug!(
            message = %message.id,
            relay = %verdict.relay_url,
            accepted,
            status = message.status.as_str(),
            "relay verdict applied"
        );
        Ok(())
    }

    fn mark_accepted(&self, message: &mut Message) -> Result<()> {
        message.status = MessageStatus::Accepted;
        message.next_retry_at = None;
        self.ctx.storage.save_message(message)?;
        self.retry.remove_from_queue(&message.id)?;
        info!(
            message = %message.id,
            relays = message.success_count(),
            "message accepted"
        );
        Ok(())
    }

    fn commit(&self, message: &Message) {
        self.ctx.view.upsert(message.clone());
        self.ctx.state.message_changed(&message.id, message.status);
        match self.retry.queue_len() {
            Ok(queued) => self.ctx.state.set_queued(queued),
            Err(e) => warn!(error = %e, "could not read retry queue length"),
        }
    }
}

impl std::fmt::Debug for OutgoingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingPipeline")
            .field("max_content_length", &self.max_content_length)
            .finish_non_exhaustive()
    }
}

fn is_permanent_rejection(result: &RelayResult) -> bool {
    !result.success
        && result
            .error
            .as_deref()
            .is_some_and(|e| PERMANENT_REJECTIONS.iter().any(|p| e.starts_with(p)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::clock::Clock;
    use crate::config::{BackoffConfig, RetryPolicy};
    use crate::crypto::Identity;
    use crate::pipeline::tests::{context, Fixture};
    use crate::queue::MessageStorage;
    use crate::relay::{FrameSubscription, RelayMessage};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: BackoffConfig {
                initial_delay_ms: 1_000,
                max_delay_ms: 10_000,
                multiplier: 2.0,
                jitter: 0.0,
            },
            sweep_interval_ms: 1_000,
        }
    }

    fn outgoing(fixture: &Fixture, max_retries: u32) -> OutgoingPipeline {
        let retry = Arc::new(RetryManager::new(
            policy(max_retries),
            fixture.ctx.storage.clone(),
            fixture.ctx.pool.health().clone(),
            fixture.clock.clone(),
        ));
        OutgoingPipeline::new(fixture.ctx.clone(), retry, 100)
    }

    async fn settle(pipeline: &OutgoingPipeline, frames: &mut FrameSubscription, count: usize) {
        for _ in 0..count {
            let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
                .await
                .expect("OK frame")
                .expect("pool open");
            if let RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } = frame.message
            {
                pipeline
                    .handle_ok(&frame.relay_url, &event_id, accepted, &message)
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn invalid_input_persists_nothing() {
        let fixture = context(&[]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();

        let err = pipeline.send("not-a-key", "hi").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRecipientKey(_)));
        let err = pipeline.send(&bob, "   ").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let err = pipeline.send(&bob, &"x".repeat(101)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        assert_eq!(fixture.ctx.storage.message_count().unwrap(), 0);
        assert!(fixture.ctx.view.is_empty());
    }

    #[tokio::test]
    async fn npub_recipient_is_normalized_to_hex() {
        let fixture = context(&[]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate();

        let outcome = pipeline.send(&bob.npub().unwrap(), "hi").await.unwrap();
        let stored = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        assert_eq!(stored.recipient_key, bob.pubkey_hex());
    }

    #[tokio::test]
    async fn no_open_relays_queues_without_spending_budget() {
        let fixture = context(&[]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(DeliveryError::NoRelaysConnected));
        assert_eq!(outcome.status, MessageStatus::Queued);
        assert!(outcome.relay_results.is_empty());

        let stored = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Queued);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(pipeline.retry().queue_len().unwrap(), 1);
        assert_eq!(fixture.ctx.state.snapshot().queued_messages, 1);
    }

    #[tokio::test]
    async fn accepted_by_open_relays() {
        let fixture = context(&["wss://relay-a.test", "wss://relay-b.test"]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status, MessageStatus::Accepted);
        assert_eq!(outcome.relay_results.len(), 2);
        assert_eq!(pipeline.retry().queue_len().unwrap(), 0);
        assert_eq!(
            fixture.ctx.view.get(&outcome.message_id).unwrap().status,
            MessageStatus::Accepted
        );
    }

    #[tokio::test]
    async fn permanent_rejection_everywhere_is_terminal() {
        let fixture = context(&["wss://relay-a.test", "wss://relay-b.test"]).await;
        for relay in &fixture.relays {
            relay.set_reject_events(Some("blocked: not on the allow list"));
        }
        let pipeline = outgoing(&fixture, 3);
        let mut frames = fixture.ctx.pool.subscribe_to_messages();
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        settle(&pipeline, &mut frames, 2).await;

        let stored = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Rejected);
        assert_eq!(stored.success_count(), 0);
        assert_eq!(stored.relay_results.len(), 2);
        assert_eq!(pipeline.retry().queue_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_rejection_schedules_a_retry() {
        let fixture = context(&["wss://relay-a.test"]).await;
        fixture.relays[0].set_reject_events(Some("rate-limited: slow down"));
        let pipeline = outgoing(&fixture, 3);
        let mut frames = fixture.ctx.pool.subscribe_to_messages();
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        settle(&pipeline, &mut frames, 1).await;

        let stored = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_retry_at.unwrap() > fixture.clock.now());
        assert_eq!(
            stored.relay_results[0].error.as_deref(),
            Some("rate-limited: slow down")
        );
    }

    #[tokio::test]
    async fn duplicate_refusal_counts_as_acceptance() {
        let fixture = context(&["wss://relay-a.test"]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        pipeline
            .handle_ok(
                "wss://relay-a.test",
                &outcome.message_id,
                false,
                "duplicate: already have this event",
            )
            .unwrap();

        let stored = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Accepted);
    }

    #[tokio::test]
    async fn verdicts_during_publish_are_held_back() {
        let fixture = context(&[]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();
        let outcome = pipeline.send(&bob, "hello").await.unwrap();

        let mut message = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        message.status = MessageStatus::Sending;
        fixture.ctx.storage.save_message(&message).unwrap();

        pipeline
            .handle_ok("wss://relay-a.test", &message.id, true, "")
            .unwrap();
        assert_eq!(lock(&pipeline.pending_verdicts)[&message.id].len(), 1);
        let stored = fixture.ctx.storage.get_message(&message.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn unsettled_publish_is_requeued() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("courier.db");
        let mut fixture = context(&["wss://relay-a.test"]).await;
        fixture.ctx.storage = Arc::new(MessageStorage::new(&path).unwrap());
        let pipeline = outgoing(&fixture, 3);

        let admin = rusqlite::Connection::open(&path).unwrap();
        admin
            .execute_batch(
                "CREATE TRIGGER refuse_acceptance BEFORE UPDATE OF status ON messages
                 WHEN NEW.status = 'accepted'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let bob = Identity::generate().pubkey_hex();
        let err = pipeline.send(&bob, "hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        let stored = fixture.ctx.storage.list_messages().unwrap().remove(0);
        assert_eq!(stored.status, MessageStatus::Queued);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(pipeline.retry().queue_len().unwrap(), 1);
        assert!(lock(&pipeline.pending_verdicts).is_empty());
        assert_eq!(
            fixture.ctx.view.get(&stored.id).unwrap().status,
            MessageStatus::Queued
        );

        admin.execute_batch("DROP TRIGGER refuse_acceptance;").unwrap();
        let outcomes = pipeline.process_retry_queue().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(
            fixture.ctx.storage.get_message(&stored.id).unwrap().unwrap().status,
            MessageStatus::Accepted
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn verdicts_racing_a_publish_leave_view_matching_storage() {
        let fixture = context(&["wss://relay-a.test"]).await;
        let pipeline = Arc::new(outgoing(&fixture, 3));
        let bob = Identity::generate().pubkey_hex();
        let id = pipeline.send(&bob, "hello").await.unwrap().message_id;

        let done = Arc::new(AtomicBool::new(false));
        let verdicts = {
            let pipeline = Arc::clone(&pipeline);
            let id = id.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    pipeline
                        .handle_ok("wss://relay-a.test", &id, false, "blocked: spam")
                        .unwrap();
                    std::thread::yield_now();
                }
            })
        };

        for _ in 0..25 {
            match pipeline.retry_failed_message(&id).await {
                Ok(_) | Err(PipelineError::NotRetryable { .. }) => {}
                Err(e) => panic!("retry failed: {e}"),
            }
            tokio::task::yield_now().await;
        }
        done.store(true, Ordering::Release);
        verdicts.join().unwrap();

        let stored = fixture.ctx.storage.get_message(&id).unwrap().unwrap();
        let viewed = fixture.ctx.view.get(&id).unwrap();
        assert_eq!(viewed.status, stored.status);
        assert_eq!(viewed.relay_results, stored.relay_results);
        assert!(lock(&pipeline.pending_verdicts).is_empty());
    }

    #[tokio::test]
    async fn sweep_delivers_once_a_relay_opens() {
        let fixture = context(&[]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        assert!(pipeline.process_retry_queue().await.unwrap().is_empty());

        fixture.network.add_relay("wss://relay-a.test");
        fixture
            .ctx
            .pool
            .set_relay_urls(&["wss://relay-a.test".to_string()])
            .unwrap();
        assert!(fixture.ctx.pool.wait_for_open(1, Duration::from_secs(2)).await);

        let outcomes = pipeline.process_retry_queue().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].message_id, outcome.message_id);
        assert!(outcomes[0].success);
        assert_eq!(pipeline.retry().queue_len().unwrap(), 0);
        assert_eq!(
            fixture.network.relay("wss://relay-a.test").unwrap().published().len(),
            1
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_message() {
        let fixture = context(&["wss://relay-a.test"]).await;
        fixture.relays[0].set_reject_events(Some("error: storage full"));
        let pipeline = outgoing(&fixture, 1);
        let mut frames = fixture.ctx.pool.subscribe_to_messages();
        let bob = Identity::generate().pubkey_hex();

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        settle(&pipeline, &mut frames, 1).await;
        assert_eq!(
            fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap().status,
            MessageStatus::Queued
        );

        fixture.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(pipeline.process_retry_queue().await.unwrap().len(), 1);
        settle(&pipeline, &mut frames, 1).await;

        let stored = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(pipeline.retry().queue_len().unwrap(), 0);
        assert_eq!(fixture.relays[0].published().len(), 2);
        assert!(fixture.relays[0].stored_events().is_empty());
    }

    #[tokio::test]
    async fn manual_retry_checks_state() {
        let fixture = context(&["wss://relay-a.test"]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();

        let err = pipeline.retry_failed_message("missing").await.unwrap_err();
        assert!(matches!(err, PipelineError::MessageNotFound(_)));

        let outcome = pipeline.send(&bob, "hello").await.unwrap();
        let err = pipeline
            .retry_failed_message(&outcome.message_id)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotRetryable { .. }));

        let mut message = fixture.ctx.storage.get_message(&outcome.message_id).unwrap().unwrap();
        message.status = MessageStatus::Failed;
        message.retry_count = 3;
        fixture.ctx.storage.save_message(&message).unwrap();

        let retried = pipeline.retry_failed_message(&message.id).await.unwrap();
        assert!(retried.success);
        let stored = fixture.ctx.storage.get_message(&message.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Accepted);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn publish_outcomes_feed_health() {
        let fixture = context(&["wss://relay-a.test"]).await;
        let pipeline = outgoing(&fixture, 3);
        let bob = Identity::generate().pubkey_hex();
        pipeline.send(&bob, "hello").await.unwrap();

        let metrics = fixture.ctx.pool.health().get_metrics("wss://relay-a.test").unwrap();
        assert_eq!(metrics.publish_successes, 1);
    }
}
