//! Relay connectivity.
//!
//! The [`RelayPool`] keeps one connection per configured relay, reconnects
//! under the [`HealthMonitor`](crate::health::HealthMonitor)'s backoff and
//! circuit breaker, fans publishes out to every open relay and forwards
//! parsed inbound frames to listeners.
//!
//! # Architecture
//!
//! ```text
//! set_relay_urls ──▶ RelayPool ──spawn──▶ driver (one per relay)
//!                       ▲                    │ Transport::connect
//!                       │ PoolEvent          ▼
//!                   reducer task ◀──── TransportLink (in/out frames)
//!                       │
//!                       ├──▶ HealthMonitor (attempt/success/failure)
//!                       ├──▶ watch::Sender<Vec<RelayConnection>>
//!                       └──▶ FrameSubscription listeners
//! ```
//!
//! # Security
//!
//! - **WSS only**: plaintext `ws://` URLs are rejected unless
//!   [`PoolConfig::allow_insecure`](crate::config::PoolConfig::allow_insecure)
//!   is set for local development.
//! - **Strict frames**: malformed relay frames are logged and dropped; they
//!   never reach the message pipeline.

mod error;
mod frame;
mod pool;
mod transport;
mod types;
mod websocket;

pub use error::{FrameError, RelayError, Result};
pub use frame::{ClientMessage, Filter, RelayMessage};
pub use pool::{validate_relay_urls, FrameSubscription, RelayPool};
pub use transport::{Transport, TransportEvent, TransportLink};
pub use types::{
    ConnectionStatus, InboundFrame, MultiRelayPublishResult, RelayConnection, RelayResult,
    Subscription,
};
pub use websocket::WebSocketTransport;
