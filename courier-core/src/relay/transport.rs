//! The socket seam beneath the relay pool.
//!
//! A [`Transport`] opens one connection and hands back a [`TransportLink`]:
//! a bounded sender for outbound text frames and a receiver of inbound
//! events. Dropping the sender closes the connection.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::Result;

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The connection failed.
    Error(String),
    /// The connection closed, with the peer's reason if any.
    Closed(Option<String>),
}

/// The two halves of an open connection.
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound text frames.
    pub outbound: mpsc::Sender<String>,
    /// Inbound events; ends after `Error` or `Closed`.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to relays.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`](super::RelayError::Connection) if
    /// the connection cannot be established.
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}
