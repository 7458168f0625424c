//! WebSocket transport backed by tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, trace};

use super::error::{RelayError, Result};
use super::transport::{Transport, TransportEvent, TransportLink};

/// Opens real WebSocket connections.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    buffer: usize,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 256)
    }
}

impl WebSocketTransport {
    /// Creates a transport with the given handshake timeout and per-link
    /// channel capacity.
    #[must_use]
    pub fn new(connect_timeout: Duration, buffer: usize) -> Self {
        Self {
            connect_timeout,
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        let handshake = tokio_tungstenite::connect_async(url);
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| RelayError::Timeout(format!("connect to {url}")))?
            .map_err(|e| RelayError::Connection {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(self.buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(self.buffer);

        let writer_events = inbound_tx.clone();
        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    let _ = writer_events.send(TransportEvent::Error(e.to_string())).await;
                    return;
                }
            }
            debug!(relay = %writer_url, "outbound closed, closing socket");
            let _ = write.close().await;
        });

        let reader_url = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(WsMessage::Text(text)) => TransportEvent::Message(text),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            trace!(relay = %reader_url, "dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        let _ = inbound_tx.send(TransportEvent::Closed(reason)).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if inbound_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed(None)).await;
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
