//! Observable client state.
//!
//! The state lives in a [`tokio::sync::watch`] channel, so a slow observer
//! only ever sees the latest snapshot and never a backlog of updates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::queue::MessageStatus;
use crate::relay::{ConnectionStatus, RelayConnection};

/// The last NOTICE a relay sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayNotice {
    /// The relay that sent it.
    pub relay_url: String,
    /// The notice text.
    pub message: String,
    /// When it arrived.
    pub received_at: DateTime<Utc>,
}

/// The last message whose status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageUpdate {
    /// The message id.
    pub message_id: String,
    /// Its new status.
    pub status: MessageStatus,
}

/// A snapshot of the client state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CourierState {
    /// Incremented on every change.
    pub revision: u64,
    /// Every configured relay connection.
    pub connections: Vec<RelayConnection>,
    /// Number of open connections.
    pub open_relays: usize,
    /// Number of messages in the retry queue.
    pub queued_messages: usize,
    /// Whether a gap sync is in flight.
    pub syncing: bool,
    /// When the last gap sync finished.
    pub last_sync_completed_at: Option<DateTime<Utc>>,
    /// The most recent relay notice.
    pub last_notice: Option<RelayNotice>,
    /// The most recent message status change.
    pub last_message: Option<MessageUpdate>,
}

/// Writer side of the state channel.
#[derive(Debug, Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<CourierState>>,
}

impl StateHandle {
    /// Creates a handle holding the default state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CourierState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Returns a receiver that observes every later snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CourierState> {
        self.tx.subscribe()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CourierState {
        self.tx.borrow().clone()
    }

    /// Applies `f` and bumps the revision.
    pub fn update(&self, f: impl FnOnce(&mut CourierState)) {
        self.tx.send_modify(|state| {
            f(state);
            state.revision += 1;
        });
    }

    /// Replaces the connection list.
    pub fn set_connections(&self, connections: Vec<RelayConnection>) {
        self.update(|state| {
            state.open_relays = connections
                .iter()
                .filter(|c| c.status == ConnectionStatus::Open)
                .count();
            state.connections = connections;
        });
    }

    /// Records the retry queue length.
    pub fn set_queued(&self, queued: usize) {
        if self.tx.borrow().queued_messages != queued {
            self.update(|state| state.queued_messages = queued);
        }
    }

    /// Marks a gap sync as started.
    pub fn sync_started(&self) {
        self.update(|state| state.syncing = true);
    }

    /// Marks the gap sync as finished at `at`.
    pub fn sync_finished(&self, at: DateTime<Utc>) {
        self.update(|state| {
            state.syncing = false;
            state.last_sync_completed_at = Some(at);
        });
    }

    /// Records a relay notice.
    pub fn notice(&self, relay_url: &str, message: &str, at: DateTime<Utc>) {
        self.update(|state| {
            state.last_notice = Some(RelayNotice {
                relay_url: relay_url.to_string(),
                message: message.to_string(),
                received_at: at,
            });
        });
    }

    /// Records a message status change.
    pub fn message_changed(&self, message_id: &str, status: MessageStatus) {
        self.update(|state| {
            state.last_message = Some(MessageUpdate {
                message_id: message_id.to_string(),
                status,
            });
        });
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}
