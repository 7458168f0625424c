//! Error types for envelope construction and verification.

use thiserror::Error;

/// Errors that can occur while building, parsing or verifying envelopes.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid envelope structure or content.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Envelope signature verification failed.
    #[error("Invalid envelope signature")]
    InvalidSignature,

    /// Hex encoding/decoding error.
    #[error("Hex encoding error: {0}")]
    HexError(String),
}

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

impl From<hex::FromHexError> for EnvelopeError {
    fn from(e: hex::FromHexError) -> Self {
        Self::HexError(e.to_string())
    }
}
