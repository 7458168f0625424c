//! The message pipeline.
//!
//! # Architecture
//!
//! ```text
//! send ─→ OutgoingPipeline: validate → encrypt → sign → persist → publish_to_all → reduce
//!                                                                       │
//!                                                         RetryManager (queued / failed)
//!
//! RelayPool frames ─→ FrameRouter ─┬─ EVENT  → IncomingPipeline: verify → dedupe → decrypt → persist → view
//!                                  ├─ OK     → OutgoingPipeline::handle_ok
//!                                  ├─ EOSE   → GapSync::on_eose
//!                                  └─ NOTICE → StateHandle
//! ```
//!
//! Every status change lands in storage first, then in the [`OrderedView`]
//! and the observable [`CourierState`].

mod error;
mod incoming;
mod outgoing;
mod router;
mod state;
mod sync;
mod view;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use error::{DeliveryError, PipelineError, Result};
pub use incoming::{AdmitOutcome, IncomingPipeline};
pub use outgoing::{OutgoingPipeline, SendOutcome};
pub use router::FrameRouter;
pub use state::{CourierState, MessageUpdate, RelayNotice, StateHandle};
pub use sync::{GapSync, SyncStart};
pub use view::OrderedView;

use crate::clock::Clock;
use crate::crypto::{CryptoProvider, Identity};
use crate::queue::MessageStorage;
use crate::relay::RelayPool;

/// Collaborators shared by both directions of the pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    /// The local identity.
    pub identity: Arc<Identity>,
    /// Encryption and signatures.
    pub crypto: Arc<dyn CryptoProvider>,
    /// Relay connections.
    pub pool: RelayPool,
    /// Message persistence.
    pub storage: Arc<MessageStorage>,
    /// Messages in display order.
    pub view: Arc<OrderedView>,
    /// Observable state.
    pub state: StateHandle,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl PipelineContext {
    /// Returns the local public key (hex).
    #[must_use]
    pub fn local_key(&self) -> String {
        self.identity.pubkey_hex()
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("identity", &self.identity)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
