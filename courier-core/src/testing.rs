//! In-memory relays for tests.
//!
//! A [`MemoryNetwork`] maps relay URLs to [`MemoryRelay`]s and hands out a
//! [`MemoryTransport`] that connects to them over channels. Each relay
//! speaks the same frames a real relay does: it stores and acknowledges
//! events, answers REQ with stored matches and EOSE, and pushes new events
//! to matching subscriptions. Relays can be told to refuse connections,
//! reject events, stay silent or drop every client.

#![allow(clippy::missing_panics_doc, clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::envelope::Envelope;
use crate::relay::{
    ClientMessage, Filter, RelayError, RelayMessage, Result, Transport, TransportEvent,
    TransportLink,
};

const CHANNEL_CAPACITY: usize = 1024;

/// A set of in-memory relays addressed by URL.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds (or returns the existing) relay at `url`.
    pub fn add_relay(&self, url: &str) -> Arc<MemoryRelay> {
        Arc::clone(
            lock(&self.relays)
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(MemoryRelay::new(url))),
        )
    }

    /// Returns the relay at `url`.
    #[must_use]
    pub fn relay(&self, url: &str) -> Option<Arc<MemoryRelay>> {
        lock(&self.relays).get(url).cloned()
    }

    /// A transport that connects to this network's relays.
    #[must_use]
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
        }
    }
}

/// Connects to relays on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        let relay = self.network.relay(url).ok_or_else(|| RelayError::Connection {
            url: url.to_string(),
            reason: "no such relay".to_string(),
        })?;
        relay.accept()
    }
}

#[derive(Debug, Clone)]
struct Behavior {
    refuse_connections: bool,
    reject_reason: Option<String>,
    acknowledge: bool,
}

#[derive(Debug)]
struct Client {
    tx: mpsc::Sender<TransportEvent>,
    subscriptions: HashMap<String, Filter>,
}

/// A single in-memory relay.
#[derive(Debug)]
pub struct MemoryRelay {
    url: String,
    behavior: Mutex<Behavior>,
    events: Mutex<Vec<Envelope>>,
    clients: Mutex<HashMap<u64, Client>>,
    received: Mutex<Vec<ClientMessage>>,
    next_client: AtomicU64,
    connections: AtomicUsize,
}

impl MemoryRelay {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            behavior: Mutex::new(Behavior {
                refuse_connections: false,
                reject_reason: None,
                acknowledge: true,
            }),
            events: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            next_client: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
        }
    }

    /// The relay URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Makes new connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        lock(&self.behavior).refuse_connections = refuse;
    }

    /// Makes the relay answer every EVENT with `OK false <reason>`.
    pub fn set_reject_events(&self, reason: Option<&str>) {
        lock(&self.behavior).reject_reason = reason.map(str::to_string);
    }

    /// Controls whether OK frames are sent at all.
    pub fn set_acknowledge(&self, acknowledge: bool) {
        lock(&self.behavior).acknowledge = acknowledge;
    }

    /// Closes every client connection.
    pub fn disconnect_all(&self) {
        let clients: Vec<Client> = lock(&self.clients).drain().map(|(_, c)| c).collect();
        for client in clients {
            let _ = client
                .tx
                .try_send(TransportEvent::Closed(Some("relay restarting".to_string())));
        }
    }

    /// Sends `text` verbatim to every client.
    pub fn send_raw(&self, text: &str) {
        for client in lock(&self.clients).values() {
            let _ = client.tx.try_send(TransportEvent::Message(text.to_string()));
        }
    }

    /// Sends a NOTICE to every client.
    pub fn send_notice(&self, message: &str) {
        if let Ok(text) = RelayMessage::Notice(message.to_string()).to_json() {
            self.send_raw(&text);
        }
    }

    /// Stores `envelope` without verifying it and pushes it to matching
    /// subscriptions.
    pub fn deliver(&self, envelope: Envelope) {
        if self.store(&envelope) {
            self.broadcast(&envelope);
        }
    }

    /// Envelopes the relay has stored.
    #[must_use]
    pub fn stored_events(&self) -> Vec<Envelope> {
        lock(&self.events).clone()
    }

    /// Every well-formed client frame received, in order.
    #[must_use]
    pub fn received(&self) -> Vec<ClientMessage> {
        lock(&self.received).clone()
    }

    /// Envelopes clients published, including rejected ones.
    #[must_use]
    pub fn published(&self) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::Event(envelope) => Some(*envelope),
                _ => None,
            })
            .collect()
    }

    /// Total connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Subscription ids open across all clients.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.clients)
            .values()
            .flat_map(|client| client.subscriptions.keys().cloned())
            .collect();
        ids.sort();
        ids
    }

    fn accept(self: &Arc<Self>) -> Result<TransportLink> {
        if lock(&self.behavior).refuse_connections {
            return Err(RelayError::Connection {
                url: self.url.clone(),
                reason: "connection refused".to_string(),
            });
        }

        self.connections.fetch_add(1, Ordering::SeqCst);
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        lock(&self.clients).insert(
            id,
            Client {
                tx: inbound_tx,
                subscriptions: HashMap::new(),
            },
        );

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                relay.handle(id, &text);
            }
            lock(&relay.clients).remove(&id);
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn handle(&self, client: u64, text: &str) {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                self.send_to(client, &RelayMessage::Notice(format!("invalid: {e}")));
                return;
            }
        };
        trace!(relay = %self.url, client, "frame received");
        lock(&self.received).push(message.clone());

        match message {
            ClientMessage::Event(envelope) => self.on_event(client, *envelope),
            ClientMessage::Req {
                subscription_id,
                filter,
            } => self.on_req(client, subscription_id, filter),
            ClientMessage::Close(subscription_id) => {
                if let Some(entry) = lock(&self.clients).get_mut(&client) {
                    entry.subscriptions.remove(&subscription_id);
                }
            }
        }
    }

    fn on_event(&self, client: u64, envelope: Envelope) {
        let behavior = lock(&self.behavior).clone();
        let verdict = if let Some(reason) = behavior.reject_reason {
            Err(reason)
        } else if envelope.verify_signature().is_err() {
            Err("invalid: bad signature".to_string())
        } else if self.store(&envelope) {
            self.broadcast(&envelope);
            Ok(String::new())
        } else {
            Ok("duplicate: already have this event".to_string())
        };

        if behavior.acknowledge {
            let (accepted, message) = match verdict {
                Ok(message) => (true, message),
                Err(message) => (false, message),
            };
            self.send_to(
                client,
                &RelayMessage::Ok {
                    event_id: envelope.id,
                    accepted,
                    message,
                },
            );
        }
    }

    fn on_req(&self, client: u64, subscription_id: String, filter: Filter) {
        let mut matches: Vec<Envelope> = lock(&self.events)
            .iter()
            .filter(|envelope| filter.matches(envelope))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matches.truncate(limit as usize);
        }

        if let Some(entry) = lock(&self.clients).get_mut(&client) {
            entry.subscriptions.insert(subscription_id.clone(), filter);
        }
        for envelope in matches {
            self.send_to(
                client,
                &RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    envelope: Box::new(envelope),
                },
            );
        }
        self.send_to(client, &RelayMessage::Eose(subscription_id));
    }

    fn store(&self, envelope: &Envelope) -> bool {
        let mut events = lock(&self.events);
        if events.iter().any(|existing| existing.id == envelope.id) {
            return false;
        }
        events.push(envelope.clone());
        true
    }

    fn broadcast(&self, envelope: &Envelope) {
        for client in lock(&self.clients).values() {
            for (subscription_id, filter) in &client.subscriptions {
                if !filter.matches(envelope) {
                    continue;
                }
                let frame = RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    envelope: Box::new(envelope.clone()),
                };
                if let Ok(text) = frame.to_json() {
                    let _ = client.tx.try_send(TransportEvent::Message(text));
                }
            }
        }
    }

    fn send_to(&self, client: u64, message: &RelayMessage) {
        let Ok(text) = message.to_json() else {
            return;
        };
        if let Some(entry) = lock(&self.clients).get(&client) {
            let _ = entry.tx.try_send(TransportEvent::Message(text));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::envelope::UnsignedEnvelope;

    fn signed(created_at: i64, recipient: &str) -> Envelope {
        let sender = Identity::generate();
        let unsigned =
            UnsignedEnvelope::direct_message(&sender.pubkey_hex(), recipient, "ct".to_string())
                .with_created_at(created_at);
        let signature = sender.sign(&unsigned.id_bytes().unwrap()).unwrap();
        unsigned.into_signed(signature).unwrap()
    }

    async fn next_frame(link: &mut TransportLink) -> RelayMessage {
        match link.inbound.recv().await {
            Some(TransportEvent::Message(text)) => RelayMessage::from_json(&text).unwrap(),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_url_is_refused() {
        let network = MemoryNetwork::new();
        let result = network.transport().connect("wss://nowhere.test").await;
        assert!(matches!(result, Err(RelayError::Connection { .. })));
    }

    #[tokio::test]
    async fn acknowledges_and_stores_events() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("wss://a.test");
        let mut link = network.transport().connect("wss://a.test").await.unwrap();

        let recipient = Identity::generate().pubkey_hex();
        let envelope = signed(100, &recipient);
        let frame = ClientMessage::Event(Box::new(envelope.clone())).to_json().unwrap();
        link.outbound.send(frame.clone()).await.unwrap();

        assert_eq!(
            next_frame(&mut link).await,
            RelayMessage::Ok {
                event_id: envelope.id.clone(),
                accepted: true,
                message: String::new(),
            }
        );
        assert_eq!(relay.stored_events(), vec![envelope.clone()]);

        link.outbound.send(frame).await.unwrap();
        match next_frame(&mut link).await {
            RelayMessage::Ok { accepted, message, .. } => {
                assert!(accepted);
                assert!(message.starts_with("duplicate"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(relay.stored_events().len(), 1);
    }

    #[tokio::test]
    async fn rejects_when_configured() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("wss://a.test");
        relay.set_reject_events(Some("blocked: test"));
        let mut link = network.transport().connect("wss://a.test").await.unwrap();

        let envelope = signed(100, &Identity::generate().pubkey_hex());
        link.outbound
            .send(ClientMessage::Event(Box::new(envelope)).to_json().unwrap())
            .await
            .unwrap();

        match next_frame(&mut link).await {
            RelayMessage::Ok { accepted, message, .. } => {
                assert!(!accepted);
                assert_eq!(message, "blocked: test");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(relay.stored_events().is_empty());
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test]
    async fn req_replays_newest_first_with_limit_then_eose() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("wss://a.test");
        let recipient = Identity::generate().pubkey_hex();
        for created_at in [10, 30, 20] {
            relay.deliver(signed(created_at, &recipient));
        }
        relay.deliver(signed(40, &Identity::generate().pubkey_hex()));

        let mut link = network.transport().connect("wss://a.test").await.unwrap();
        let req = ClientMessage::Req {
            subscription_id: "sync".to_string(),
            filter: Filter::direct_messages_to(&recipient).limit(2),
        };
        link.outbound.send(req.to_json().unwrap()).await.unwrap();

        let mut replayed = Vec::new();
        loop {
            match next_frame(&mut link).await {
                RelayMessage::Event { envelope, .. } => replayed.push(envelope.created_at),
                RelayMessage::Eose(id) => {
                    assert_eq!(id, "sync");
                    break;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(replayed, vec![30, 20]);
        assert_eq!(relay.subscription_ids(), vec!["sync".to_string()]);
    }

    #[tokio::test]
    async fn refuses_when_configured() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("wss://a.test");
        relay.set_refuse_connections(true);
        assert!(network.transport().connect("wss://a.test").await.is_err());
        assert_eq!(relay.connection_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_all_closes_links() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("wss://a.test");
        let mut link = network.transport().connect("wss://a.test").await.unwrap();
        relay.disconnect_all();
        assert!(matches!(
            link.inbound.recv().await,
            Some(TransportEvent::Closed(Some(_)))
        ));
        assert!(link.inbound.recv().await.is_none());
        assert_eq!(relay.client_count(), 0);
    }
}
