//! Routes parsed relay frames to the part of the pipeline that owns them.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::error::Result;
use super::incoming::{AdmitOutcome, IncomingPipeline};
use super::outgoing::OutgoingPipeline;
use super::state::StateHandle;
use super::sync::GapSync;
use crate::clock::Clock;
use crate::relay::{FrameSubscription, InboundFrame, RelayMessage};

/// Dispatches inbound frames.
pub struct FrameRouter {
    incoming: Arc<IncomingPipeline>,
    outgoing: Arc<OutgoingPipeline>,
    sync: Arc<GapSync>,
    state: StateHandle,
    clock: Arc<dyn Clock>,
}

impl FrameRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(
        incoming: Arc<IncomingPipeline>,
        outgoing: Arc<OutgoingPipeline>,
        sync: Arc<GapSync>,
        state: StateHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            incoming,
            outgoing,
            sync,
            state,
            clock,
        }
    }

    /// Handles one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails while handling it.
    pub async fn route(&self, frame: InboundFrame) -> Result<()> {
        let relay_url = frame.relay_url;
        match frame.message {
            RelayMessage::Event {
                subscription_id,
                envelope,
            } => {
                let outcome = self.incoming.admit(&envelope).await?;
                if !matches!(outcome, AdmitOutcome::Admitted(_)) {
                    trace!(
                        relay = %relay_url,
                        subscription = %subscription_id,
                        event = %envelope.id,
                        ?outcome,
                        "event not admitted"
                    );
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                self.outgoing
                    .handle_ok(&relay_url, &event_id, accepted, &message)?;
            }
            RelayMessage::Notice(message) => {
                info!(relay = %relay_url, notice = %message, "relay notice");
                self.state.notice(&relay_url, &message, self.clock.now());
            }
            RelayMessage::Eose(subscription_id) => {
                self.sync.on_eose(&relay_url, &subscription_id);
            }
        }
        Ok(())
    }

    /// Routes frames until the stream ends.
    pub async fn run(self: Arc<Self>, mut frames: FrameSubscription) {
        while let Some(frame) = frames.recv().await {
            let kind = frame.message.kind();
            if let Err(e) = self.route(frame).await {
                warn!(frame = kind, error = %e, "failed to handle frame");
            }
        }
        debug!("frame stream ended");
    }
}

impl std::fmt::Debug for FrameRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRouter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{RetryPolicy, SyncConfig};
    use crate::crypto::{CryptoProvider, Identity, Nip04Crypto};
    use crate::envelope::UnsignedEnvelope;
    use crate::pipeline::tests::{context, Fixture};
    use crate::pipeline::SyncStart;
    use crate::queue::{MessageStatus, RetryManager};

    fn router(fixture: &Fixture) -> Arc<FrameRouter> {
        let retry = Arc::new(RetryManager::new(
            RetryPolicy::default(),
            fixture.ctx.storage.clone(),
            fixture.ctx.pool.health().clone(),
            fixture.clock.clone(),
        ));
        Arc::new(FrameRouter::new(
            Arc::new(IncomingPipeline::new(fixture.ctx.clone())),
            Arc::new(OutgoingPipeline::new(fixture.ctx.clone(), retry, 10_000)),
            GapSync::new(fixture.ctx.clone(), SyncConfig::default()),
            fixture.ctx.state.clone(),
            fixture.clock.clone(),
        ))
    }

    #[tokio::test]
    async fn notice_lands_in_state() {
        let fixture = context(&[]).await;
        let router = router(&fixture);
        router
            .route(InboundFrame {
                relay_url: "wss://relay-a.test".to_string(),
                message: RelayMessage::Notice("slow down".to_string()),
            })
            .await
            .unwrap();

        let notice = fixture.ctx.state.snapshot().last_notice.unwrap();
        assert_eq!(notice.relay_url, "wss://relay-a.test");
        assert_eq!(notice.message, "slow down");
    }

    #[tokio::test]
    async fn events_are_admitted() {
        let fixture = context(&[]).await;
        let router = router(&fixture);
        let alice = Identity::generate();
        let ciphertext = Nip04Crypto
            .encrypt("hello", &fixture.ctx.local_key(), &alice)
            .await
            .unwrap();
        let unsigned =
            UnsignedEnvelope::direct_message(&alice.pubkey_hex(), &fixture.ctx.local_key(), ciphertext);
        let signature = Nip04Crypto.sign(&unsigned, &alice).await.unwrap();
        let envelope = unsigned.into_signed(signature).unwrap();

        router
            .route(InboundFrame {
                relay_url: "wss://relay-a.test".to_string(),
                message: RelayMessage::Event {
                    subscription_id: "inbox".to_string(),
                    envelope: Box::new(envelope.clone()),
                },
            })
            .await
            .unwrap();

        let stored = fixture.ctx.storage.get_message(&envelope.id).unwrap().unwrap();
        assert_eq!(stored.plaintext, "hello");
        assert_eq!(stored.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn run_completes_a_sync_from_relay_eose() {
        let fixture = context(&["wss://relay-a.test"]).await;
        let router = router(&fixture);
        let frames = fixture.ctx.pool.subscribe_to_messages();
        tokio::spawn(Arc::clone(&router).run(frames));

        assert!(matches!(
            router.sync.start(None).unwrap(),
            SyncStart::Started { .. }
        ));
        let completed = tokio::time::timeout(Duration::from_secs(2), async {
            while router.sync.is_syncing() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(completed.is_ok());
        assert!(fixture.ctx.state.snapshot().last_sync_completed_at.is_some());
    }
}
