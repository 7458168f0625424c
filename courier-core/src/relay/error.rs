//! Error types for relay operations.
//!
//! This module defines errors that can occur during relay communication
//! and while parsing relay wire frames.

use thiserror::Error;

/// Errors that can occur during relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection to relay failed.
    #[error("Failed to connect to relay {url}: {reason}")]
    Connection {
        /// The relay URL that failed.
        url: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Event publishing failed.
    #[error("Failed to publish event: {0}")]
    Publish(String),

    /// Invalid relay URL.
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Subscription failed.
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// The relay has no open connection.
    #[error("Relay not connected: {0}")]
    NotConnected(String),

    /// Timeout waiting for operation.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The pool has been shut down.
    #[error("Relay pool is shut down")]
    Shutdown,
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors produced by the strict wire-frame parser.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame is not valid JSON.
    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is not a non-empty JSON array.
    #[error("Frame must be a non-empty JSON array")]
    NotAnArray,

    /// The first element is not a known frame type.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// The frame has the wrong number of elements.
    #[error("{frame} frame expects {expected} elements, got {actual}")]
    Arity {
        /// The frame type.
        frame: &'static str,
        /// Required element count.
        expected: usize,
        /// Actual element count.
        actual: usize,
    },

    /// An element has the wrong type or value.
    #[error("{frame} frame has invalid {field}: {reason}")]
    InvalidField {
        /// The frame type.
        frame: &'static str,
        /// The offending element.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}
