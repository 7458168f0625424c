//! Error types for the message pipeline.
//!
//! [`PipelineError`] covers failures surfaced to the caller as `Err`.
//! Delivery problems that still leave the message persisted and queued are
//! reported in the outcome as a [`DeliveryError`] instead.

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::envelope::EnvelopeError;
use crate::queue::{MessageStatus, QueueError};
use crate::relay::{FrameError, RelayError};

/// Errors surfaced by pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Input rejected before anything was done.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The recipient key is not a valid public key.
    #[error("Invalid recipient key: {0}")]
    InvalidRecipientKey(String),

    /// Encrypting the plaintext failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Signing the envelope failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The envelope could not be built.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// A wire frame could not be encoded.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Message storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] QueueError),

    /// Relay configuration failed.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// No message with this id.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The message is not in a state that allows the operation.
    #[error("Message {id} cannot be retried while {status}")]
    NotRetryable {
        /// The message id.
        id: String,
        /// Its current status.
        status: &'static str,
    },
}

impl PipelineError {
    /// Builds a [`NotRetryable`](Self::NotRetryable) error.
    #[must_use]
    pub fn not_retryable(id: &str, status: MessageStatus) -> Self {
        Self::NotRetryable {
            id: id.to_string(),
            status: status.as_str(),
        }
    }
}

impl From<CryptoError> for PipelineError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Encryption(msg) => Self::Encryption(msg),
            CryptoError::Signing(msg) => Self::Signing(msg),
            CryptoError::InvalidPublicKey(msg) | CryptoError::Bech32(msg) => {
                Self::InvalidRecipientKey(msg)
            }
            other => Self::Encryption(other.to_string()),
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why a send did not reach any relay. The message is persisted either way.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// No relay was open; the message is queued.
    #[error("No relays connected; message queued for retry")]
    NoRelaysConnected,

    /// Every relay refused or failed; the message is queued or failed.
    #[error("All relays rejected the message")]
    AllRelaysRejected,
}
