//! Catching up on messages missed while offline.
//!
//! A gap sync is an ad-hoc REQ for direct messages since the newest one we
//! already have. Results flow through normal admission. Only one sync runs
//! at a time; it completes when every relay the REQ went to has sent EOSE,
//! or when the sync timeout fires, and completion closes the subscription.

// The running sync is updated under one lock per transition.
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::Result;
use super::{lock, PipelineContext};
use crate::config::SyncConfig;
use crate::relay::Filter;

/// Result of asking for a gap sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStart {
    /// A new sync was sent to these relays.
    Started {
        /// Subscription id of the sync.
        id: String,
        /// Relays the REQ was sent to.
        relays: Vec<String>,
    },
    /// A sync is already in flight; nothing was sent.
    AlreadyRunning,
    /// No relay is open.
    NoRelays,
}

struct Running {
    id: String,
    waiting: HashSet<String>,
    timeout: Option<JoinHandle<()>>,
}

/// Runs one gap sync at a time.
pub struct GapSync {
    ctx: PipelineContext,
    config: SyncConfig,
    running: Mutex<Option<Running>>,
    next_id: AtomicU64,
}

impl GapSync {
    /// Creates the sync coordinator.
    #[must_use]
    pub fn new(ctx: PipelineContext, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            running: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Starts a sync for messages created at or after `since`.
    ///
    /// Without `since`, the newest stored incoming timestamp is used, or
    /// no lower bound if nothing was received yet.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the pool is shut down.
    pub fn start(self: &Arc<Self>, since: Option<i64>) -> Result<SyncStart> {
        let mut running = lock(&self.running);
        if running.is_some() {
            debug!("gap sync already running");
            return Ok(SyncStart::AlreadyRunning);
        }

        let since = match since {
            Some(since) => Some(since),
            None => self.ctx.storage.latest_incoming_timestamp()?,
        };
        let mut filter =
            Filter::direct_messages_to(&self.ctx.local_key()).limit(self.config.limit);
        if let Some(since) = since {
            filter = filter.since(since);
        }

        let id = format!("sync-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let relays = self.ctx.pool.subscribe(&id, filter)?;
        if relays.is_empty() {
            self.ctx.pool.unsubscribe(&id);
            return Ok(SyncStart::NoRelays);
        }

        let weak = Arc::downgrade(self);
        let timeout = self.config.timeout();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, &timer_id);
        });

        *running = Some(Running {
            id: id.clone(),
            waiting: relays.iter().cloned().collect(),
            timeout: Some(timer),
        });
        self.ctx.state.sync_started();
        info!(subscription = %id, relays = relays.len(), since, "gap sync started");

        Ok(SyncStart::Started { id, relays })
    }

    /// Records an EOSE from `relay_url`.
    ///
    /// Returns true if it completed the running sync.
    pub fn on_eose(&self, relay_url: &str, subscription_id: &str) -> bool {
        let mut running = lock(&self.running);
        let Some(current) = running.as_mut() else {
            return false;
        };
        if current.id != subscription_id {
            return false;
        }
        current.waiting.remove(relay_url);
        if !current.waiting.is_empty() {
            debug!(
                subscription = subscription_id,
                relay = relay_url,
                remaining = current.waiting.len(),
                "relay finished gap sync"
            );
            return false;
        }

        if let Some(done) = running.take() {
            self.finish(done, false);
        }
        true
    }

    /// Returns whether a sync is in flight.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Returns the subscription id of the running sync.
    #[must_use]
    pub fn current_id(&self) -> Option<String> {
        lock(&self.running).as_ref().map(|r| r.id.clone())
    }

    /// Abandons the running sync.
    pub fn cancel(&self) {
        if let Some(done) = lock(&self.running).take() {
            self.finish(done, true);
        }
    }

    fn finish(&self, mut done: Running, timed_out: bool) {
        if let Some(timer) = done.timeout.take() {
            timer.abort();
        }
        self.ctx.pool.unsubscribe(&done.id);
        self.ctx.state.sync_finished(self.ctx.clock.now());
        if timed_out {
            warn!(
                subscription = %done.id,
                missing = done.waiting.len(),
                "gap sync ended before every relay finished"
            );
        } else {
            info!(subscription = %done.id, "gap sync complete");
        }
    }
}

impl std::fmt::Debug for GapSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapSync")
            .field("config", &self.config)
            .field("running", &self.current_id())
            .finish_non_exhaustive()
    }
}

fn expire(sync: &Weak<GapSync>, id: &str) {
    let Some(sync) = sync.upgrade() else {
        return;
    };
    let mut running = lock(&sync.running);
    if running.as_ref().is_some_and(|r| r.id == id) {
        if let Some(mut done) = running.take() {
            // Running on the timer task itself.
            done.timeout = None;
            sync.finish(done, true);
        }
    }
}
