//! Courier Core Library
//!
//! End-to-end encrypted direct messaging over a set of untrusted relays.
//! Messages are encrypted and signed on the client, published to every
//! open relay, retried until a relay takes them, and on the way in
//! verified, deduplicated, decrypted and kept in timestamp order.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

mod api;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod health;
pub mod pipeline;
pub mod queue;
pub mod relay;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use api::{Courier, CourierBuilder, INBOX_SUBSCRIPTION};
