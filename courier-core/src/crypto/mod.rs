//! Identity keys and the crypto collaborator.
//!
//! # Security
//!
//! - Secret key bytes are zeroized on drop and never printed
//! - Envelope ids are compared in constant time during verification
//! - The pipeline verifies signatures before any decryption is attempted

mod error;
mod keys;
mod provider;

pub use error::{CryptoError, Result};
pub use keys::{parse_public_key, Identity, SECP};
pub use provider::{CryptoProvider, Nip04Crypto};
