//! Reusable helpers for Courier integration tests.
//!
//! Clients talk to in-memory relays over channels; crypto, storage and the
//! pipeline are the real implementations.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::clock::Clock;
use courier_core::config::CourierConfig;
use courier_core::crypto::{CryptoProvider, Identity, Nip04Crypto, Result as CryptoResult};
use courier_core::envelope::{Envelope, UnsignedEnvelope};
use courier_core::testing::MemoryNetwork;
use courier_core::Courier;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Real NIP-04 crypto that records the order of calls.
#[derive(Debug, Default)]
pub struct RecordingCrypto {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingCrypto {
    /// Returns the calls made so far.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CryptoProvider for RecordingCrypto {
    async fn encrypt(
        &self,
        plaintext: &str,
        recipient_key: &str,
        sender: &Identity,
    ) -> CryptoResult<String> {
        self.record("encrypt");
        Nip04Crypto.encrypt(plaintext, recipient_key, sender).await
    }

    async fn decrypt(
        &self,
        ciphertext: &str,
        sender_key: &str,
        recipient: &Identity,
    ) -> CryptoResult<String> {
        self.record("decrypt");
        Nip04Crypto.decrypt(ciphertext, sender_key, recipient).await
    }

    async fn sign(&self, envelope: &UnsignedEnvelope, identity: &Identity) -> CryptoResult<String> {
        self.record("sign");
        Nip04Crypto.sign(envelope, identity).await
    }

    async fn verify(&self, envelope: &Envelope) -> bool {
        self.record("verify");
        Nip04Crypto.verify(envelope).await
    }

    fn is_valid_public_key(&self, key: &str) -> bool {
        Nip04Crypto.is_valid_public_key(key)
    }
}

/// Options for [`client`].
pub struct ClientOptions {
    pub config: CourierConfig,
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl ClientOptions {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            config: CourierConfig::default().with_relays(urls.iter().copied()),
            crypto: None,
            clock: None,
        }
    }
}

/// Builds a client for `identity` on `network`, adding any missing relays.
pub fn client(network: &Arc<MemoryNetwork>, identity: Identity, options: ClientOptions) -> Courier {
    init_tracing();
    for url in &options.config.pool.relay_urls {
        if network.relay(url).is_none() {
            network.add_relay(url);
        }
    }

    let mut builder = Courier::builder(options.config, identity)
        .transport(Arc::new(network.transport()));
    if let Some(crypto) = options.crypto {
        builder = builder.crypto(crypto);
    }
    if let Some(clock) = options.clock {
        builder = builder.clock(clock);
    }
    builder.build().expect("client should build")
}

/// Builds and starts a client, waiting for `open` relays.
pub async fn started_client(
    network: &Arc<MemoryNetwork>,
    identity: Identity,
    options: ClientOptions,
    open: usize,
) -> Courier {
    let courier = client(network, identity, options);
    courier.start().expect("client should start");
    assert!(
        courier.wait_for_relays(open, Duration::from_secs(3)).await,
        "relays did not open"
    );
    courier
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(within, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Waits until every relay in `urls` has `count` subscriptions named `id`.
pub async fn wait_for_subscriptions(
    network: &Arc<MemoryNetwork>,
    urls: &[&str],
    id: &str,
    count: usize,
) -> bool {
    wait_until(Duration::from_secs(3), || {
        urls.iter().all(|url| {
            network.relay(url).is_some_and(|relay| {
                relay.subscription_ids().iter().filter(|s| *s == id).count() >= count
            })
        })
    })
    .await
}

/// Builds a signed direct message from `sender` to `recipient`.
pub async fn signed_dm(sender: &Identity, recipient: &str, text: &str, created_at: i64) -> Envelope {
    let ciphertext = Nip04Crypto
        .encrypt(text, recipient, sender)
        .await
        .expect("encrypt");
    let unsigned = UnsignedEnvelope::direct_message(&sender.pubkey_hex(), recipient, ciphertext)
        .with_created_at(created_at);
    let signature = Nip04Crypto.sign(&unsigned, sender).await.expect("sign");
    unsigned.into_signed(signature).expect("envelope")
}
