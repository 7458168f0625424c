//! Signed envelopes for encrypted direct messages.
//!
//! # Architecture
//!
//! ```text
//! plaintext → CryptoProvider::encrypt → UnsignedEnvelope (kind 4, ["p", recipient])
//!                                              ↓
//!                                   CryptoProvider::sign
//!                                              ↓
//!                                   Envelope (ready for relays)
//! ```

mod error;
mod event;
mod tags;

pub use error::{EnvelopeError, Result};
pub use event::{Envelope, UnsignedEnvelope, KIND_DIRECT_MESSAGE};
pub use tags::TagBuilder;
