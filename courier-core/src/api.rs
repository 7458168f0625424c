//! The consumer-facing client.
//!
//! [`Courier`] wires the relay pool, the message pipeline and the retry
//! queue together for one identity and runs the background work: routing
//! inbound frames, syncing and sweeping the retry queue when relays
//! connect, and the periodic retry sweep.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CourierConfig;
use crate::crypto::{parse_public_key, CryptoProvider, Identity, Nip04Crypto};
use crate::health::{HealthMonitor, RelayHealthMetrics};
use crate::pipeline::{
    lock, CourierState, FrameRouter, GapSync, IncomingPipeline, OrderedView, OutgoingPipeline,
    PipelineContext, PipelineError, Result, SendOutcome, StateHandle, SyncStart,
};
use crate::queue::{conversation_id, Message, MessageStatus, MessageStorage, RetryManager};
use crate::relay::{Filter, RelayConnection, RelayPool, Transport, WebSocketTransport};

/// Subscription id of the standing "addressed to me" REQ.
pub const INBOX_SUBSCRIPTION: &str = "inbox";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configures and builds a [`Courier`].
pub struct CourierBuilder {
    config: CourierConfig,
    identity: Identity,
    crypto: Arc<dyn CryptoProvider>,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    storage: Option<Arc<MessageStorage>>,
}

impl CourierBuilder {
    /// Starts a builder with NIP-04 crypto, WebSocket relays, the system
    /// clock and in-memory storage.
    #[must_use]
    pub fn new(config: CourierConfig, identity: Identity) -> Self {
        Self {
            config,
            identity,
            crypto: Arc::new(Nip04Crypto),
            transport: None,
            clock: Arc::new(SystemClock),
            storage: None,
        }
    }

    /// Replaces the crypto collaborator.
    #[must_use]
    pub fn crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Replaces the relay transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses existing storage.
    #[must_use]
    pub fn storage(mut self, storage: Arc<MessageStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Stores messages in the SQLite database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn database(self, path: &Path) -> Result<Self> {
        let storage = MessageStorage::new(path)?;
        Ok(self.storage(Arc::new(storage)))
    }

    /// Builds the client. Relays are not contacted until
    /// [`Courier::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or storage fails.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Result<Courier> {
        let Self {
            config,
            identity,
            crypto,
            transport,
            clock,
            storage,
        } = self;
        config.validate()?;

        let transport = transport.unwrap_or_else(|| {
            Arc::new(WebSocketTransport::new(
                CONNECT_TIMEOUT,
                config.pool.outbound_buffer,
            ))
        });
        let storage = match storage {
            Some(storage) => storage,
            None => Arc::new(MessageStorage::in_memory()?),
        };

        let health = Arc::new(HealthMonitor::with_clock(
            config.health.clone(),
            Arc::clone(&clock),
        ));
        let pool = RelayPool::new(config.pool.clone(), Arc::clone(&health), transport);

        let retry = Arc::new(RetryManager::new(
            config.retry.clone(),
            Arc::clone(&storage),
            health,
            Arc::clone(&clock),
        ));
        retry.recover_interrupted()?;

        let view = Arc::new(OrderedView::new());
        view.load(storage.list_messages()?);

        let state = StateHandle::new();
        state.set_queued(retry.queue_len()?);

        let ctx = PipelineContext {
            identity: Arc::new(identity),
            crypto,
            pool,
            storage,
            view,
            state: state.clone(),
            clock: Arc::clone(&clock),
        };
        let outgoing = Arc::new(OutgoingPipeline::new(
            ctx.clone(),
            retry,
            config.max_content_length,
        ));
        let incoming = Arc::new(IncomingPipeline::new(ctx.clone()));
        let sync = GapSync::new(ctx.clone(), config.sync.clone());
        let router = Arc::new(FrameRouter::new(
            incoming,
            Arc::clone(&outgoing),
            Arc::clone(&sync),
            state,
            clock,
        ));

        Ok(Courier {
            config,
            ctx,
            outgoing,
            sync,
            router,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for CourierBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierBuilder")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// An encrypted direct-messaging client for one identity.
///
/// # Example
///
/// ```no_run
/// use courier_core::config::CourierConfig;
/// use courier_core::crypto::Identity;
/// use courier_core::Courier;
///
/// # async fn example(recipient: &str) -> courier_core::pipeline::Result<()> {
/// let config = CourierConfig::default().with_relay("wss://relay.damus.io");
/// let courier = Courier::builder(config, Identity::generate()).build()?;
/// courier.start()?;
///
/// let outcome = courier.send_message(recipient, "hello").await?;
/// println!("{} -> {:?}", outcome.message_id, outcome.status);
/// # Ok(())
/// # }
/// ```
pub struct Courier {
    config: CourierConfig,
    ctx: PipelineContext,
    outgoing: Arc<OutgoingPipeline>,
    sync: Arc<GapSync>,
    router: Arc<FrameRouter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Courier {
    /// Starts configuring a client.
    #[must_use]
    pub fn builder(config: CourierConfig, identity: Identity) -> CourierBuilder {
        CourierBuilder::new(config, identity)
    }

    /// Connects to the configured relays and starts background work.
    ///
    /// Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured relay URL is invalid or the client
    /// was shut down.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pool = &self.ctx.pool;

        let frames = pool.subscribe_to_messages();
        let mut tasks = vec![tokio::spawn(Arc::clone(&self.router).run(frames))];

        pool.subscribe(
            INBOX_SUBSCRIPTION,
            Filter::direct_messages_to(&self.ctx.local_key()).limit(0),
        )?;
        pool.set_relay_urls(&self.config.pool.relay_urls)?;

        tasks.push(tokio::spawn(watch_connections(
            pool.watch_connections(),
            self.ctx.state.clone(),
            Arc::clone(&self.outgoing),
            Arc::clone(&self.sync),
            self.config.sync.on_connect,
        )));
        if self.config.retry.sweep_interval_ms > 0 {
            tasks.push(tokio::spawn(sweep_retries(
                Arc::clone(&self.outgoing),
                Duration::from_millis(self.config.retry.sweep_interval_ms),
            )));
        }
        lock(&self.tasks).extend(tasks);

        info!(
            pubkey = %self.ctx.local_key(),
            relays = self.config.pool.relay_urls.len(),
            "courier started"
        );
        Ok(())
    }

    /// Returns the local public key (hex).
    #[must_use]
    pub fn public_key(&self) -> String {
        self.ctx.local_key()
    }

    /// Encrypts, signs and publishes a direct message.
    ///
    /// # Errors
    ///
    /// See [`OutgoingPipeline::send`].
    pub async fn send_message(&self, recipient: &str, plaintext: &str) -> Result<SendOutcome> {
        self.outgoing.send(recipient, plaintext).await
    }

    /// Returns the status of a message.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MessageNotFound`] for an unknown id.
    pub fn get_message_status(&self, id: &str) -> Result<MessageStatus> {
        self.get_message(id)?
            .map(|message| message.status)
            .ok_or_else(|| PipelineError::MessageNotFound(id.to_string()))
    }

    /// Returns a stored message.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.ctx.storage.get_message(id)?)
    }

    /// Republishes a failed, rejected or queued message now.
    ///
    /// # Errors
    ///
    /// See [`OutgoingPipeline::retry_failed_message`].
    pub async fn retry_failed_message(&self, id: &str) -> Result<SendOutcome> {
        self.outgoing.retry_failed_message(id).await
    }

    /// Republishes every due message in the retry queue.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn process_retry_queue(&self) -> Result<Vec<SendOutcome>> {
        self.outgoing.process_retry_queue().await
    }

    /// Requests messages created at or after `since`, defaulting to the
    /// newest message already received.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the client was shut down.
    pub fn sync_missed_messages(&self, since: Option<i64>) -> Result<SyncStart> {
        self.sync.start(since)
    }

    /// Returns whether a gap sync is in flight.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.sync.is_syncing()
    }

    /// Observes client state. Slow receivers only see the latest snapshot.
    #[must_use]
    pub fn subscribe_to_state(&self) -> watch::Receiver<CourierState> {
        self.ctx.state.subscribe()
    }

    /// Returns the current state snapshot.
    #[must_use]
    pub fn state(&self) -> CourierState {
        self.ctx.state.snapshot()
    }

    /// Returns every configured relay connection.
    #[must_use]
    pub fn get_connections(&self) -> Vec<RelayConnection> {
        self.ctx.pool.connections()
    }

    /// Waits until at least `count` relays are open.
    pub async fn wait_for_relays(&self, count: usize, within: Duration) -> bool {
        self.ctx.pool.wait_for_open(count, within).await
    }

    /// Returns health metrics for a relay.
    #[must_use]
    pub fn get_relay_health(&self, url: &str) -> Option<RelayHealthMetrics> {
        self.ctx.pool.health().get_metrics(url)
    }

    /// Replaces the relay set.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is invalid; nothing changes then.
    pub fn set_relay_urls(&self, urls: &[String]) -> Result<()> {
        Ok(self.ctx.pool.set_relay_urls(urls)?)
    }

    /// Returns every message, newest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.ctx.view.snapshot()
    }

    /// Returns the messages exchanged with `peer`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidRecipientKey`] if `peer` is not a
    /// public key.
    pub fn conversation(&self, peer: &str) -> Result<Vec<Message>> {
        let peer = parse_public_key(peer)?.to_hex();
        let id = conversation_id(&self.ctx.local_key(), &peer);
        Ok(self.ctx.view.conversation(&id))
    }

    /// Stops background work and disconnects every relay. Idempotent.
    pub fn shutdown(&self) {
        self.sync.cancel();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if !self.ctx.pool.is_shut_down() {
            self.ctx.pool.shutdown();
            info!("courier shut down");
        }
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.ctx.pool.shutdown();
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("identity", &self.ctx.identity)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Mirrors connection snapshots into the client state and reacts to relays
/// that just opened.
async fn watch_connections(
    mut connections: watch::Receiver<Vec<RelayConnection>>,
    state: StateHandle,
    outgoing: Arc<OutgoingPipeline>,
    sync: Arc<GapSync>,
    sync_on_connect: bool,
) {
    let mut open: HashSet<String> = HashSet::new();
    loop {
        let snapshot = connections.borrow_and_update().clone();
        let now_open: HashSet<String> = snapshot
            .iter()
            .filter(|c| c.is_open())
            .map(|c| c.url.clone())
            .collect();
        let opened = now_open.difference(&open).count();
        open = now_open;
        state.set_connections(snapshot);

        if opened > 0 {
            debug!(opened, "relays opened");
            if sync_on_connect {
                if let Err(e) = sync.start(None) {
                    warn!(error = %e, "gap sync failed to start");
                }
            }
            if let Err(e) = outgoing.process_retry_queue().await {
                warn!(error = %e, "retry sweep failed");
            }
        }

        if connections.changed().await.is_err() {
            break;
        }
    }
}

async fn sweep_retries(outgoing: Arc<OutgoingPipeline>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = outgoing.process_retry_queue().await {
            warn!(error = %e, "retry sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::testing::MemoryNetwork;

    fn courier(network: &Arc<MemoryNetwork>, urls: &[&str]) -> Courier {
        for url in urls {
            network.add_relay(url);
        }
        let config = CourierConfig::default().with_relays(urls.iter().copied());
        Courier::builder(config, Identity::generate())
            .transport(Arc::new(network.transport()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = CourierConfig::default().with_max_content_length(0);
        let err = Courier::builder(config, Identity::generate())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::Invalid { field: "max_content_length", .. })
        ));
    }

    #[tokio::test]
    async fn start_connects_and_subscribes_inbox() {
        let network = MemoryNetwork::new();
        let courier = courier(&network, &["wss://relay-a.test", "wss://relay-b.test"]);
        courier.start().unwrap();
        courier.start().unwrap();

        assert!(courier.wait_for_relays(2, Duration::from_secs(2)).await);
        assert_eq!(courier.get_connections().len(), 2);
        assert!(courier.get_relay_health("wss://relay-a.test").is_some());

        let relay = network.relay("wss://relay-a.test").unwrap();
        let subscribed = tokio::time::timeout(Duration::from_secs(2), async {
            while !relay.subscription_ids().contains(&INBOX_SUBSCRIPTION.to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(subscribed.is_ok());
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test]
    async fn queued_message_goes_out_when_relays_connect() {
        let network = MemoryNetwork::new();
        let courier = courier(&network, &["wss://relay-a.test"]);
        let bob = Identity::generate().pubkey_hex();

        let outcome = courier.send_message(&bob, "sent while offline").await.unwrap();
        assert_eq!(outcome.status, MessageStatus::Queued);
        assert_eq!(courier.state().queued_messages, 1);

        courier.start().unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(3), async {
            while courier.get_message_status(&outcome.message_id).unwrap() != MessageStatus::Accepted
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(accepted.is_ok());
        assert_eq!(courier.state().queued_messages, 0);
    }

    #[tokio::test]
    async fn unknown_message_status() {
        let network = MemoryNetwork::new();
        let courier = courier(&network, &[]);
        assert!(matches!(
            courier.get_message_status("nope"),
            Err(PipelineError::MessageNotFound(_))
        ));
        assert!(courier.get_message("nope").unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_accepts_npub() {
        let network = MemoryNetwork::new();
        let courier = courier(&network, &[]);
        let bob = Identity::generate();

        courier.send_message(&bob.pubkey_hex(), "one").await.unwrap();
        courier.send_message(&bob.pubkey_hex(), "two").await.unwrap();

        assert_eq!(courier.conversation(&bob.npub().unwrap()).unwrap().len(), 2);
        assert!(courier.conversation(&Identity::generate().pubkey_hex()).unwrap().is_empty());
        assert!(courier.conversation("garbage").is_err());
        assert_eq!(courier.messages().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let network = MemoryNetwork::new();
        let courier = courier(&network, &["wss://relay-a.test"]);
        courier.start().unwrap();
        courier.shutdown();
        courier.shutdown();
        assert!(courier.set_relay_urls(&["wss://relay-a.test".to_string()]).is_err());
        assert!(format!("{courier:?}").contains("Courier"));
    }

    #[tokio::test]
    async fn state_subscribers_see_the_latest_snapshot() {
        let network = MemoryNetwork::new();
        let courier = courier(&network, &[]);
        let mut rx = courier.subscribe_to_state();
        let before = rx.borrow_and_update().revision;

        courier
            .send_message(&Identity::generate().pubkey_hex(), "queued")
            .await
            .unwrap();
        rx.changed().await.unwrap();

        let state = rx.borrow_and_update().clone();
        assert!(state.revision > before);
        assert_eq!(state.queued_messages, 1);
        assert_eq!(state.last_message.unwrap().status, MessageStatus::Queued);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn messages_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        let network = MemoryNetwork::new();
        let identity_hex = {
            let identity = Identity::generate();
            let hex = identity.pubkey_hex();
            let courier = Courier::builder(CourierConfig::default(), identity)
                .transport(Arc::new(network.transport()))
                .database(&path)
                .unwrap()
                .build()
                .unwrap();
            courier
                .send_message(&Identity::generate().pubkey_hex(), "persisted")
                .await
                .unwrap();
            hex
        };

        let storage = Arc::new(MessageStorage::new(&path).unwrap());
        let courier = Courier::builder(CourierConfig::default(), Identity::generate())
            .transport(Arc::new(network.transport()))
            .storage(storage)
            .build()
            .unwrap();
        let messages = courier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_key, identity_hex);
        assert_eq!(courier.state().queued_messages, 1);
    }
}
