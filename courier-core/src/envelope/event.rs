//! Envelope types for direct messages.
//!
//! - `UnsignedEnvelope`: the event before signing, with its content-derived id
//! - `Envelope`: the signed wire unit published to relays

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::error::{EnvelopeError, Result};
use super::tags::TagBuilder;
use crate::crypto::SECP;

/// Event kind for encrypted direct messages (NIP-04).
pub const KIND_DIRECT_MESSAGE: u16 = 4;

/// An envelope that has not been signed yet.
///
/// The id is derived from the content, so it is known before signing and
/// the signature covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEnvelope {
    /// Sender public key (hex).
    pub pubkey: String,

    /// Unix timestamp (seconds).
    pub created_at: i64,

    /// Event kind.
    pub kind: u16,

    /// Event tags.
    pub tags: Vec<Vec<String>>,

    /// Encrypted content.
    pub content: String,
}

impl UnsignedEnvelope {
    /// Builds a kind 4 direct message addressed to `recipient_pubkey`.
    #[must_use]
    pub fn direct_message(sender_pubkey: &str, recipient_pubkey: &str, ciphertext: String) -> Self {
        Self {
            pubkey: sender_pubkey.to_string(),
            created_at: Utc::now().timestamp(),
            kind: KIND_DIRECT_MESSAGE,
            tags: vec![TagBuilder::p_tag(recipient_pubkey)],
            content: ciphertext,
        }
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Computes the envelope id (hex).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn id(&self) -> Result<String> {
        calculate_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Computes the envelope id as raw bytes, ready for signing.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn id_bytes(&self) -> Result<[u8; 32]> {
        let id = self.id()?;
        hex::decode(&id)?
            .try_into()
            .map_err(|_| EnvelopeError::InvalidEnvelope("Invalid ID length".to_string()))
    }

    /// Attaches a signature, producing the wire envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the id cannot be computed.
    pub fn into_signed(self, signature: String) -> Result<Envelope> {
        let id = self.id()?;
        Ok(Envelope {
            id,
            sender_key: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            ciphertext: self.content,
            signature,
        })
    }
}

/// A signed envelope ready for relay transmission.
///
/// Serialized with the NIP-01 field names:
///
/// ```json
/// {
///   "id": "...",          // SHA256 of the canonical serialization
///   "pubkey": "...",      // Sender public key
///   "created_at": 123456,
///   "kind": 4,
///   "tags": [["p", "<recipient>"]],
///   "content": "...",     // NIP-04 ciphertext
///   "sig": "..."          // Schnorr signature over id
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope id (32-byte SHA256, hex).
    pub id: String,

    /// Sender public key (hex).
    #[serde(rename = "pubkey")]
    pub sender_key: String,

    /// Unix timestamp (seconds).
    pub created_at: i64,

    /// Event kind.
    pub kind: u16,

    /// Event tags.
    pub tags: Vec<Vec<String>>,

    /// Encrypted content.
    #[serde(rename = "content")]
    pub ciphertext: String,

    /// Schnorr signature (64 bytes, hex).
    #[serde(rename = "sig")]
    pub signature: String,
}

impl Envelope {
    /// Returns the recipient key from the `p` routing tag.
    #[must_use]
    pub fn recipient_key(&self) -> Option<&str> {
        TagBuilder::find(&self.tags, "p")
    }

    /// Returns whether this envelope is a direct message addressed to `pubkey`.
    #[must_use]
    pub fn is_addressed_to(&self, pubkey: &str) -> bool {
        self.kind == KIND_DIRECT_MESSAGE && TagBuilder::find_all(&self.tags, "p").any(|p| p == pubkey)
    }

    /// Serializes this envelope to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(EnvelopeError::from)
    }

    /// Deserializes an envelope from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(EnvelopeError::from)
    }

    /// Verifies the id and the signature.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidEnvelope`] for malformed fields or an
    /// id mismatch, and [`EnvelopeError::InvalidSignature`] if the signature
    /// does not verify.
    pub fn verify_signature(&self) -> Result<()> {
        use nostr::secp256k1::{schnorr::Signature, Message, XOnlyPublicKey};

        let pubkey_bytes: [u8; 32] = hex::decode(&self.sender_key)?
            .try_into()
            .map_err(|_| EnvelopeError::InvalidEnvelope("Invalid pubkey length".to_string()))?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|e| EnvelopeError::InvalidEnvelope(format!("Invalid pubkey: {e}")))?;

        let sig_bytes: [u8; 64] = hex::decode(&self.signature)?
            .try_into()
            .map_err(|_| EnvelopeError::InvalidEnvelope("Invalid signature length".to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| EnvelopeError::InvalidEnvelope(format!("Invalid signature: {e}")))?;

        let calculated_id = calculate_id(
            &self.sender_key,
            self.created_at,
            self.kind,
            &self.tags,
            &self.ciphertext,
        )?;

        if !bool::from(calculated_id.as_bytes().ct_eq(self.id.as_bytes())) {
            return Err(EnvelopeError::InvalidEnvelope("Envelope ID mismatch".to_string()));
        }

        let id_bytes: [u8; 32] = hex::decode(&self.id)?
            .try_into()
            .map_err(|_| EnvelopeError::InvalidEnvelope("Invalid ID length".to_string()))?;
        let message = Message::from_digest(id_bytes);

        SECP.verify_schnorr(&signature, &message, &pubkey)
            .map_err(|_| EnvelopeError::InvalidSignature)
    }
}

/// Calculates the envelope id per NIP-01.
///
/// The id is the SHA256 of `[0, pubkey, created_at, kind, tags, content]`.
fn calculate_id(
    pubkey: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))?;

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());

    Ok(hex::encode(hasher.finalize()))
}
