//! The crypto collaborator used by the message pipeline.
//!
//! The pipeline never touches primitives directly; it goes through
//! [`CryptoProvider`] so the encrypt/sign/verify/decrypt ordering can be
//! observed in tests and the primitives swapped without touching the core.

use async_trait::async_trait;
use nostr::nips::nip04;

use super::error::{CryptoError, Result};
use super::keys::{parse_public_key, Identity};
use crate::envelope::{Envelope, UnsignedEnvelope};

/// Cryptographic primitives consumed by the message pipeline.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Encrypts `plaintext` for `recipient_key` with the sender's secret.
    async fn encrypt(&self, plaintext: &str, recipient_key: &str, sender: &Identity)
        -> Result<String>;

    /// Decrypts `ciphertext` from `sender_key` with the recipient's secret.
    async fn decrypt(&self, ciphertext: &str, sender_key: &str, recipient: &Identity)
        -> Result<String>;

    /// Signs the envelope id, returning the hex signature.
    async fn sign(&self, envelope: &UnsignedEnvelope, identity: &Identity) -> Result<String>;

    /// Returns whether the envelope id and signature are valid.
    async fn verify(&self, envelope: &Envelope) -> bool;

    /// Returns whether `key` parses as a public key.
    fn is_valid_public_key(&self, key: &str) -> bool;
}

/// NIP-04 shared-secret encryption with BIP-340 signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nip04Crypto;

#[async_trait]
impl CryptoProvider for Nip04Crypto {
    async fn encrypt(
        &self,
        plaintext: &str,
        recipient_key: &str,
        sender: &Identity,
    ) -> Result<String> {
        let recipient = parse_public_key(recipient_key)?;
        let secret_key = sender.nostr_secret_key()?;
        nip04::encrypt(&secret_key, &recipient, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    async fn decrypt(
        &self,
        ciphertext: &str,
        sender_key: &str,
        recipient: &Identity,
    ) -> Result<String> {
        let sender = parse_public_key(sender_key)?;
        let secret_key = recipient.nostr_secret_key()?;
        nip04::decrypt(&secret_key, &sender, ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    async fn sign(&self, envelope: &UnsignedEnvelope, identity: &Identity) -> Result<String> {
        if envelope.pubkey != identity.pubkey_hex() {
            return Err(CryptoError::Signing(
                "Envelope pubkey does not match signing identity".to_string(),
            ));
        }
        let id_bytes = envelope
            .id_bytes()
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        identity.sign(&id_bytes)
    }

    async fn verify(&self, envelope: &Envelope) -> bool {
        envelope.verify_signature().is_ok()
    }

    fn is_valid_public_key(&self, key: &str) -> bool {
        parse_public_key(key).is_ok()
    }
}
