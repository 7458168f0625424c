//! Messages and the retry queue survive a restart.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use courier_core::config::CourierConfig;
use courier_core::crypto::Identity;
use courier_core::queue::{MessageStatus, MessageStorage};
use courier_core::testing::MemoryNetwork;
use courier_core::Courier;
use helpers::{init_tracing, wait_until};
use tempfile::TempDir;

const RELAY: &str = "wss://relay-a.test";

fn open(network: &Arc<MemoryNetwork>, dir: &TempDir, identity: Identity, relays: &[&str]) -> Courier {
    init_tracing();
    let config = CourierConfig::default().with_relays(relays.iter().copied());
    Courier::builder(config, identity)
        .transport(Arc::new(network.transport()))
        .database(&dir.path().join("courier.db"))
        .expect("database should open")
        .build()
        .expect("client should build")
}

#[tokio::test]
async fn queued_message_is_sent_after_restart() {
    let dir = TempDir::new().unwrap();
    let network = MemoryNetwork::new();
    let relay = network.add_relay(RELAY);
    let identity = Identity::generate();
    let secret = identity.export_nsec().unwrap();
    let bob = Identity::generate();

    let offline = open(&network, &dir, identity, &[]);
    offline.start().unwrap();
    let outcome = offline
        .send_message(&bob.pubkey_hex(), "sent while offline")
        .await
        .unwrap();
    assert_eq!(outcome.status, MessageStatus::Queued);
    offline.shutdown();
    drop(offline);

    let identity = Identity::from_nsec(&secret).unwrap();
    let online = open(&network, &dir, identity, &[RELAY]);
    assert_eq!(online.state().queued_messages, 1);
    assert_eq!(online.messages().len(), 1);
    online.start().unwrap();

    let id = outcome.message_id;
    assert!(
        wait_until(Duration::from_secs(3), || {
            online.get_message_status(&id).unwrap() == MessageStatus::Accepted
        })
        .await
    );
    assert_eq!(relay.stored_events().len(), 1);
    assert_eq!(relay.stored_events()[0].id, id);
    assert_eq!(online.state().queued_messages, 0);
}

#[tokio::test]
async fn send_interrupted_mid_publish_is_recovered_on_restart() {
    let dir = TempDir::new().unwrap();
    let network = MemoryNetwork::new();
    let relay = network.add_relay(RELAY);
    let identity = Identity::generate();
    let secret = identity.export_nsec().unwrap();
    let bob = Identity::generate();

    let offline = open(&network, &dir, identity, &[]);
    let outcome = offline
        .send_message(&bob.pubkey_hex(), "cut off mid-publish")
        .await
        .unwrap();
    offline.shutdown();
    drop(offline);

    // What a crash between saving `sending` and settling leaves behind.
    let id = outcome.message_id;
    {
        let storage = MessageStorage::new(&dir.path().join("courier.db")).unwrap();
        let mut message = storage.get_message(&id).unwrap().unwrap();
        message.status = MessageStatus::Sending;
        message.next_retry_at = None;
        storage.save_message(&message).unwrap();
        assert!(storage.remove_retry_entry(&id).unwrap());
    }

    let identity = Identity::from_nsec(&secret).unwrap();
    let online = open(&network, &dir, identity, &[RELAY]);
    assert_eq!(online.get_message_status(&id).unwrap(), MessageStatus::Queued);
    assert_eq!(online.state().queued_messages, 1);
    online.start().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            online.get_message_status(&id).unwrap() == MessageStatus::Accepted
        })
        .await
    );
    let stored = online.get_message(&id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
    assert_eq!(relay.stored_events().len(), 1);
    assert_eq!(online.state().queued_messages, 0);
}
