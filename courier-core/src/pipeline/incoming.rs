//! The incoming path: verify, dedupe, decrypt, persist, order.
//!
//! A direct message to oneself carries the same envelope id as the outgoing
//! record written when it was sent. When it comes back from a relay it is
//! reported as [`AdmitOutcome::OwnMessage`] and the outgoing record, with its
//! delivery status, stays the only copy. A note to self sent from another
//! device has no local record and is admitted as incoming.

use tracing::{debug, info, warn};

use super::error::Result;
use super::PipelineContext;
use crate::envelope::Envelope;
use crate::queue::{Direction, Message, MessageStatus};

/// What admission did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// New message, persisted and in the view.
    Admitted(Message),
    /// Already admitted; nothing changed.
    Duplicate,
    /// A note to self already held as this identity's outgoing record.
    OwnMessage,
    /// Signature or id did not verify; discarded before decryption.
    InvalidSignature,
    /// Not a direct message for the local identity.
    NotAddressed,
    /// Verified but could not be decrypted; discarded.
    Undecryptable,
}

impl AdmitOutcome {
    /// Returns true for [`Admitted`](Self::Admitted).
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Admits envelopes addressed to the local identity.
#[derive(Debug)]
pub struct IncomingPipeline {
    ctx: PipelineContext,
}

impl IncomingPipeline {
    /// Creates the incoming pipeline.
    #[must_use]
    pub const fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Runs `envelope` through admission.
    ///
    /// The signature is checked before anything else touches the content.
    /// Admission is idempotent per envelope id, also when the same envelope
    /// arrives from several relays at once.
    ///
    /// # Errors
    ///
    /// Returns an error only if storage fails.
    pub async fn admit(&self, envelope: &Envelope) -> Result<AdmitOutcome> {
        let ctx = &self.ctx;
        let local_key = ctx.local_key();

        if !envelope.is_addressed_to(&local_key) {
            return Ok(AdmitOutcome::NotAddressed);
        }
        if !ctx.crypto.verify(envelope).await {
            warn!(event = %envelope.id, sender = %envelope.sender_key, "discarding envelope with invalid signature");
            return Ok(AdmitOutcome::InvalidSignature);
        }
        let known = match ctx.view.get(&envelope.id) {
            Some(message) => Some(message.direction),
            None => ctx.storage.get_message(&envelope.id)?.map(|m| m.direction),
        };
        match known {
            Some(Direction::Outgoing) => {
                debug!(event = %envelope.id, "note to self already stored as sent");
                return Ok(AdmitOutcome::OwnMessage);
            }
            Some(Direction::Incoming) => return Ok(AdmitOutcome::Duplicate),
            None => {}
        }

        let plaintext = match ctx
            .crypto
            .decrypt(&envelope.ciphertext, &envelope.sender_key, &ctx.identity)
            .await
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(event = %envelope.id, error = %e, "discarding undecryptable envelope");
                return Ok(AdmitOutcome::Undecryptable);
            }
        };

        let message = Message::incoming(envelope, &local_key, plaintext);
        if !ctx.storage.insert_if_absent(&message)? {
            debug!(event = %envelope.id, "envelope admitted concurrently");
            return Ok(AdmitOutcome::Duplicate);
        }
        ctx.view.upsert(message.clone());
        ctx.state.message_changed(&message.id, MessageStatus::Delivered);
        info!(message = %message.id, sender = %message.sender_key, "message received");

        Ok(AdmitOutcome::Admitted(message))
    }
}
