//! The relay connection pool.
//!
//! Each relay has a driver task that owns its transport link and turns
//! everything that happens on it into a [`PoolEvent`]. A single reducer task
//! applies those events to the pool state, so connection status, health
//! bookkeeping and reconnect scheduling for a URL are never raced.
//!
//! Every driver is tagged with a generation number. Events from a driver
//! that has since been replaced (reconnect, removal, re-add) are ignored.

// State operations hold the lock for the whole transition.
#![allow(clippy::significant_drop_tightening)]

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use nostr::RelayUrl;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::error::{RelayError, Result};
use super::frame::{ClientMessage, Filter, RelayMessage};
use super::transport::{Transport, TransportEvent, TransportLink};
use super::types::{
    ConnectionStatus, InboundFrame, MultiRelayPublishResult, RelayConnection, RelayResult,
    Subscription,
};
use crate::config::PoolConfig;
use crate::health::HealthMonitor;

/// Events fed from drivers and retry timers into the reducer.
#[derive(Debug)]
enum PoolEvent {
    Opened {
        url: String,
        generation: u64,
        outbound: mpsc::Sender<String>,
        latency_ms: f64,
    },
    Frame {
        url: String,
        generation: u64,
        text: String,
    },
    Failed {
        url: String,
        generation: u64,
        reason: String,
    },
    Closed {
        url: String,
        generation: u64,
        reason: Option<String>,
    },
    RetryDue {
        url: String,
        generation: u64,
    },
}

struct RelayEntry {
    connection: RelayConnection,
    generation: u64,
    sender: Option<mpsc::Sender<String>>,
    driver: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl RelayEntry {
    fn new(url: &str) -> Self {
        Self {
            connection: RelayConnection::connecting(url),
            generation: 0,
            sender: None,
            driver: None,
            retry_timer: None,
        }
    }

    fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.sender = None;
    }
}

#[derive(Default)]
struct PoolState {
    relays: HashMap<String, RelayEntry>,
    subscriptions: HashMap<String, Subscription>,
    shutdown: bool,
}

struct PoolInner {
    config: PoolConfig,
    health: Arc<HealthMonitor>,
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
    connections: watch::Sender<Vec<RelayConnection>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<InboundFrame>>>,
    next_subscriber: AtomicU64,
    next_generation: AtomicU64,
    reducer: Mutex<Option<JoinHandle<()>>>,
}

/// A pool of relay connections with health-aware reconnection.
///
/// Cloning is cheap; all clones share the same connections.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use courier_core::config::{HealthConfig, PoolConfig};
/// use courier_core::health::HealthMonitor;
/// use courier_core::relay::{RelayPool, WebSocketTransport};
///
/// # async fn example() -> courier_core::relay::Result<()> {
/// let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
/// let pool = RelayPool::new(PoolConfig::default(), health, Arc::new(WebSocketTransport::default()));
/// pool.set_relay_urls(&["wss://relay.damus.io".to_string()])?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Creates an empty pool and starts its reducer task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        health: Arc<HealthMonitor>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connections_tx, _) = watch::channel(Vec::new());
        let inner = Arc::new(PoolInner {
            config,
            health,
            transport,
            state: Mutex::new(PoolState::default()),
            events: events_tx,
            connections: connections_tx,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            reducer: Mutex::new(None),
        });

        let reducer = tokio::spawn(run_reducer(Arc::downgrade(&inner), events_rx));
        *lock(&inner.reducer) = Some(reducer);
        Self { inner }
    }

    /// Returns the shared health monitor.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    /// Replaces the relay set.
    ///
    /// Removed relays are disconnected and forgotten by the health monitor.
    /// New relays start with fresh metrics and connect immediately. Relays
    /// present in both sets keep their connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidUrl`] if any URL is malformed or
    /// plaintext while insecure relays are disallowed; nothing changes in
    /// that case. Returns [`RelayError::Shutdown`] after shutdown.
    pub fn set_relay_urls(&self, urls: &[String]) -> Result<()> {
        let urls = validate_relay_urls(urls, self.inner.config.allow_insecure)?;
        let inner = &self.inner;

        let mut guard = inner.lock_state();
        if guard.shutdown {
            return Err(RelayError::Shutdown);
        }
        let state = &mut *guard;

        let removed: Vec<String> = state
            .relays
            .keys()
            .filter(|url| !urls.contains(*url))
            .cloned()
            .collect();
        for url in removed {
            if let Some(mut entry) = state.relays.remove(&url) {
                entry.stop();
            }
            inner.health.remove_relay(&url);
            info!(relay = %url, "relay removed");
        }

        for url in &urls {
            if state.relays.contains_key(url) {
                continue;
            }
            inner.health.initialize_relay(url);
            let mut entry = RelayEntry::new(url);
            inner.start_connection(url, &mut entry);
            state.relays.insert(url.clone(), entry);
            info!(relay = %url, "relay added");
        }

        inner.publish_snapshot(state);
        Ok(())
    }

    /// Returns the configured relay URLs, sorted.
    #[must_use]
    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.inner.lock_state().relays.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Returns a status snapshot of every configured relay, sorted by URL.
    #[must_use]
    pub fn connections(&self) -> Vec<RelayConnection> {
        self.inner.connections.borrow().clone()
    }

    /// Returns the URLs of open relays, highest health score first.
    #[must_use]
    pub fn open_relays(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .inner
            .lock_state()
            .relays
            .values()
            .filter(|entry| entry.connection.is_open() && entry.sender.is_some())
            .map(|entry| entry.connection.url.clone())
            .collect();
        open.sort();
        open.sort_by_key(|url| Reverse(self.inner.health.health_score(url)));
        open
    }

    /// Returns the number of open relays.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner
            .lock_state()
            .relays
            .values()
            .filter(|entry| entry.connection.is_open())
            .count()
    }

    /// Watches connection status snapshots.
    #[must_use]
    pub fn watch_connections(&self) -> watch::Receiver<Vec<RelayConnection>> {
        self.inner.connections.subscribe()
    }

    /// Waits until at least `count` relays are open.
    ///
    /// Returns false if that does not happen within `within`.
    pub async fn wait_for_open(&self, count: usize, within: Duration) -> bool {
        let mut rx = self.watch_connections();
        let reached = tokio::time::timeout(within, async move {
            loop {
                let open = rx.borrow_and_update().iter().filter(|c| c.is_open()).count();
                if open >= count {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        matches!(reached, Ok(true))
    }

    /// Sends `payload` to every open relay without waiting.
    ///
    /// Returns how many relays took the frame.
    pub fn send_to_open(&self, payload: &str) -> usize {
        self.inner
            .lock_state()
            .relays
            .values()
            .filter_map(|entry| entry.sender.as_ref())
            .filter(|sender| sender.try_send(payload.to_string()).is_ok())
            .count()
    }

    /// Hands `payload` to one relay's connection.
    ///
    /// Success means the frame was queued on an open connection within the
    /// publish timeout; the relay's own verdict arrives later as an OK frame.
    pub async fn publish_to_relay(&self, url: &str, payload: &str) -> RelayResult {
        let sender = self
            .inner
            .lock_state()
            .relays
            .get(url)
            .and_then(|entry| entry.sender.clone());
        let Some(sender) = sender else {
            return RelayResult::failed(url, RelayError::NotConnected(url.to_string()).to_string());
        };

        let started = Instant::now();
        let send = sender.send(payload.to_string());
        match tokio::time::timeout(self.inner.config.publish_timeout(), send).await {
            Ok(Ok(())) => {
                let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                RelayResult::accepted(url, Some(elapsed))
            }
            Ok(Err(_)) => RelayResult::failed(
                url,
                RelayError::Publish("connection closed".to_string()).to_string(),
            ),
            Err(_) => RelayResult::failed(url, RelayError::Timeout("publish".to_string()).to_string()),
        }
    }

    /// Publishes `payload` to every open relay in parallel.
    ///
    /// Relays are attempted and reported in descending health-score order.
    /// With no open relays the result is empty.
    pub async fn publish_to_all(&self, payload: &str) -> MultiRelayPublishResult {
        let open = self.open_relays();
        let attempts = open.iter().map(|url| self.publish_to_relay(url, payload));
        let results = futures::future::join_all(attempts).await;

        let result = MultiRelayPublishResult { results };
        debug!(
            attempted = result.total_attempted(),
            succeeded = result.success_count(),
            "published to relays"
        );
        result
    }

    /// Opens a REQ subscription on every open relay and on every relay that
    /// opens later, until [`unsubscribe`](Self::unsubscribe).
    ///
    /// Returns the relays the REQ was sent to right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is shut down or the filter cannot be
    /// encoded.
    pub fn subscribe(&self, id: &str, filter: Filter) -> Result<Vec<String>> {
        let frame = ClientMessage::Req {
            subscription_id: id.to_string(),
            filter: filter.clone(),
        }
        .to_json()
        .map_err(|e| RelayError::Subscription(e.to_string()))?;

        let mut state = self.inner.lock_state();
        if state.shutdown {
            return Err(RelayError::Shutdown);
        }
        state.subscriptions.insert(
            id.to_string(),
            Subscription {
                id: id.to_string(),
                filter,
                is_active: true,
            },
        );

        let mut sent = Vec::new();
        for entry in state.relays.values() {
            if let Some(sender) = &entry.sender {
                if sender.try_send(frame.clone()).is_ok() {
                    sent.push(entry.connection.url.clone());
                }
            }
        }
        debug!(subscription = id, relays = sent.len(), "subscription opened");
        Ok(sent)
    }

    /// Closes a subscription on every open relay.
    ///
    /// Returns false if no such subscription existed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = self.inner.lock_state();
        if state.subscriptions.remove(id).is_none() {
            return false;
        }
        if let Ok(frame) = ClientMessage::Close(id.to_string()).to_json() {
            for sender in state.relays.values().filter_map(|e| e.sender.as_ref()) {
                let _ = sender.try_send(frame.clone());
            }
        }
        debug!(subscription = id, "subscription closed");
        true
    }

    /// Returns the active subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .lock_state()
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    /// Registers a listener for parsed inbound frames from every relay.
    ///
    /// Each listener buffers up to [`PoolConfig::listener_buffer`] frames;
    /// a listener that falls further behind misses frames until it catches
    /// up. Dropping the returned handle detaches it.
    #[must_use]
    pub fn subscribe_to_messages(&self) -> FrameSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.listener_buffer);
        self.inner.lock_subscribers().insert(id, tx);
        FrameSubscription {
            id,
            receiver: rx,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Disconnects every relay and stops all background tasks.
    ///
    /// Listeners see their streams end. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut guard = self.inner.lock_state();
            if guard.shutdown {
                return;
            }
            let state = &mut *guard;
            state.shutdown = true;
            for entry in state.relays.values_mut() {
                entry.stop();
                entry.connection.transition(ConnectionStatus::Closed, None);
            }
            state.subscriptions.clear();
            self.inner.publish_snapshot(state);
        }
        self.inner.lock_subscribers().clear();
        if let Some(reducer) = lock(&self.inner.reducer).take() {
            reducer.abort();
        }
        info!("relay pool shut down");
    }

    /// Returns whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock_state().shutdown
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relay_urls())
            .field("open", &self.open_count())
            .finish_non_exhaustive()
    }
}

/// A stream of parsed frames from every relay in the pool.
#[derive(Debug)]
pub struct FrameSubscription {
    id: u64,
    receiver: mpsc::Receiver<InboundFrame>,
    pool: Weak<PoolInner>,
}

impl FrameSubscription {
    /// Receives the next frame; `None` once the pool shuts down.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.receiver.recv().await
    }

    /// Returns a frame if one is ready.
    pub fn try_recv(&mut self) -> Option<InboundFrame> {
        self.receiver.try_recv().ok()
    }

    /// Detaches this listener.
    pub fn unsubscribe(self) {}
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock_subscribers().remove(&self.id);
        }
    }
}

impl PoolInner {
    fn handle(&self, event: PoolEvent) {
        match event {
            PoolEvent::Opened {
                url,
                generation,
                outbound,
                latency_ms,
            } => self.on_opened(&url, generation, outbound, latency_ms),
            PoolEvent::Frame {
                url,
                generation,
                text,
            } => self.on_frame(url, generation, &text),
            PoolEvent::Failed {
                url,
                generation,
                reason,
            } => self.on_lost(&url, generation, ConnectionStatus::Error, Some(reason)),
            PoolEvent::Closed {
                url,
                generation,
                reason,
            } => self.on_lost(&url, generation, ConnectionStatus::Closed, reason),
            PoolEvent::RetryDue { url, generation } => self.on_retry_due(&url, generation),
        }
    }

    fn on_opened(&self, url: &str, generation: u64, outbound: mpsc::Sender<String>, latency_ms: f64) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(entry) = current_entry(&mut state.relays, url, generation) else {
            return;
        };

        self.health.record_connection_success(url);
        self.health.record_latency(url, latency_ms);
        entry.connection.transition(ConnectionStatus::Open, None);
        if let Some(timer) = entry.retry_timer.take() {
            timer.abort();
        }

        for subscription in state.subscriptions.values().filter(|s| s.is_active) {
            let req = ClientMessage::Req {
                subscription_id: subscription.id.clone(),
                filter: subscription.filter.clone(),
            };
            match req.to_json() {
                Ok(frame) => {
                    if outbound.try_send(frame).is_err() {
                        warn!(relay = %url, subscription = %subscription.id, "failed to re-issue subscription");
                    }
                }
                Err(e) => warn!(subscription = %subscription.id, error = %e, "failed to encode subscription"),
            }
        }
        entry.sender = Some(outbound);

        info!(relay = %url, latency_ms, "relay connected");
        self.publish_snapshot(state);
    }

    fn on_frame(&self, url: String, generation: u64, text: &str) {
        let current = self
            .lock_state()
            .relays
            .get(&url)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return;
        }

        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(relay = %url, error = %e, "dropping malformed frame");
                return;
            }
        };
        trace!(relay = %url, kind = message.kind(), "frame received");

        let frame = InboundFrame {
            relay_url: url,
            message,
        };
        self.lock_subscribers()
            .retain(|id, listener| match listener.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(relay = %frame.relay_url, listener = id, "listener full, dropping frame");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    fn on_lost(&self, url: &str, generation: u64, status: ConnectionStatus, reason: Option<String>) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(entry) = current_entry(&mut state.relays, url, generation) else {
            return;
        };

        entry.sender = None;
        entry.driver = None;
        if status == ConnectionStatus::Error {
            self.health.record_connection_failure(url, reason.as_deref());
            warn!(relay = %url, reason = reason.as_deref().unwrap_or(""), "relay connection failed");
        } else {
            self.health.record_disconnection(url);
            info!(relay = %url, reason = reason.as_deref().unwrap_or(""), "relay disconnected");
        }
        entry.connection.transition(status, reason);

        if !state.shutdown {
            self.schedule_retry(url, entry);
        }
        self.publish_snapshot(state);
    }

    fn on_retry_due(&self, url: &str, generation: u64) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.shutdown {
            return;
        }
        let Some(entry) = current_entry(&mut state.relays, url, generation) else {
            return;
        };
        entry.retry_timer = None;
        if entry.driver.is_some() {
            return;
        }
        self.start_connection(url, entry);
        self.publish_snapshot(state);
    }

    /// Spawns a driver for `url` unless the circuit breaker refuses, in
    /// which case a retry is scheduled instead.
    fn start_connection(&self, url: &str, entry: &mut RelayEntry) {
        if !self.health.can_connect(url) {
            debug!(relay = %url, "circuit breaker refused connection");
            self.schedule_retry(url, entry);
            return;
        }

        self.health.record_connection_attempt(url);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        entry.generation = generation;
        entry.connection.transition(ConnectionStatus::Connecting, None);
        entry.driver = Some(tokio::spawn(drive_connection(
            url.to_string(),
            generation,
            Arc::clone(&self.transport),
            self.events.clone(),
        )));
        debug!(relay = %url, generation, "connecting");
    }

    fn schedule_retry(&self, url: &str, entry: &mut RelayEntry) {
        let delay = self.health.retry_delay(url);
        if let Some(timer) = entry.retry_timer.take() {
            timer.abort();
        }

        let events = self.events.clone();
        let generation = entry.generation;
        let url_owned = url.to_string();
        entry.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PoolEvent::RetryDue {
                url: url_owned,
                generation,
            });
        }));
        debug!(relay = %url, delay_ms = delay.as_millis(), "reconnect scheduled");
    }

    fn publish_snapshot(&self, state: &PoolState) {
        let mut snapshot: Vec<RelayConnection> = state
            .relays
            .values()
            .map(|entry| entry.connection.clone())
            .collect();
        snapshot.sort_by(|a, b| a.url.cmp(&b.url));
        self.connections.send_replace(snapshot);
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<InboundFrame>>> {
        lock(&self.subscribers)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in state.relays.values_mut() {
            entry.stop();
        }
        if let Some(reducer) = self
            .reducer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reducer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn current_entry<'a>(
    relays: &'a mut HashMap<String, RelayEntry>,
    url: &str,
    generation: u64,
) -> Option<&'a mut RelayEntry> {
    relays
        .get_mut(url)
        .filter(|entry| entry.generation == generation)
}

async fn run_reducer(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.handle(event);
    }
}

async fn drive_connection(
    url: String,
    generation: u64,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let started = Instant::now();
    let TransportLink {
        outbound,
        mut inbound,
    } = match transport.connect(&url).await {
        Ok(link) => link,
        Err(e) => {
            let _ = events.send(PoolEvent::Failed {
                url,
                generation,
                reason: e.to_string(),
            });
            return;
        }
    };

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let opened = PoolEvent::Opened {
        url: url.clone(),
        generation,
        outbound,
        latency_ms,
    };
    if events.send(opened).is_err() {
        return;
    }

    while let Some(event) = inbound.recv().await {
        let event = match event {
            TransportEvent::Message(text) => PoolEvent::Frame {
                url: url.clone(),
                generation,
                text,
            },
            TransportEvent::Error(reason) => {
                let _ = events.send(PoolEvent::Failed {
                    url,
                    generation,
                    reason,
                });
                return;
            }
            TransportEvent::Closed(reason) => {
                let _ = events.send(PoolEvent::Closed {
                    url,
                    generation,
                    reason,
                });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }

    let _ = events.send(PoolEvent::Closed {
        url,
        generation,
        reason: None,
    });
}

/// Validates relay URLs, dropping duplicates.
///
/// Plaintext `ws://` is rejected unless `allow_insecure` is set.
///
/// # Errors
///
/// Returns [`RelayError::InvalidUrl`] for the first bad URL.
pub fn validate_relay_urls(relays: &[String], allow_insecure: bool) -> Result<Vec<String>> {
    let mut urls: Vec<String> = Vec::with_capacity(relays.len());

    for relay in relays {
        let relay = relay.trim();
        if relay.starts_with("ws://") && !allow_insecure {
            return Err(RelayError::InvalidUrl(format!(
                "Plaintext ws:// not allowed for security: {relay}"
            )));
        }

        RelayUrl::parse(relay).map_err(|e| RelayError::InvalidUrl(format!("{relay}: {e}")))?;

        if !urls.iter().any(|existing| existing == relay) {
            urls.push(relay.to_string());
        }
    }

    Ok(urls)
}
