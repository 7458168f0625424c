//! Long-lived identity keypair.
//!
//! The identity signs every outgoing envelope and is the local half of the
//! NIP-04 shared secret. Secret bytes are zeroized on drop and never appear
//! in `Debug` output.

use std::sync::LazyLock;

use nostr::prelude::{Keys, PublicKey, ToBech32};
use nostr::secp256k1::{Keypair, Message, Secp256k1, SecretKey as Secp256k1SecretKey};
use nostr::SecretKey as NostrSecretKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, Result};

/// Global secp256k1 context.
///
/// Building a context precomputes signing and verification tables, so one
/// shared instance is reused for every operation.
pub static SECP: LazyLock<Secp256k1<nostr::secp256k1::All>> = LazyLock::new(Secp256k1::new);

/// The local user's keypair.
///
/// # Example
///
/// ```
/// use courier_core::crypto::Identity;
///
/// let identity = Identity::generate();
/// assert_eq!(identity.pubkey_hex().len(), 64);
///
/// let nsec = identity.export_nsec().unwrap();
/// let restored = Identity::from_nsec(&nsec).unwrap();
/// assert_eq!(identity.pubkey_hex(), restored.pubkey_hex());
/// ```
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    secret_bytes: [u8; 32],

    #[zeroize(skip)]
    pubkey_bytes: [u8; 32],
}

impl Identity {
    /// Generates a new random identity using the OS random number generator.
    #[must_use]
    pub fn generate() -> Self {
        let keys = Keys::generate();

        Self {
            secret_bytes: keys.secret_key().secret_bytes(),
            pubkey_bytes: keys.public_key().to_bytes(),
        }
    }

    /// Creates an identity from raw secret key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid secp256k1 secret key.
    pub fn from_secret_bytes(secret_bytes: [u8; 32]) -> Result<Self> {
        let secret_key = Secp256k1SecretKey::from_slice(&secret_bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let keypair = Keypair::from_secret_key(&SECP, &secret_key);
        let (public_key, _parity) = keypair.x_only_public_key();

        Ok(Self {
            secret_bytes,
            pubkey_bytes: public_key.serialize(),
        })
    }

    /// Creates an identity from a hex-encoded secret key.
    ///
    /// # Errors
    ///
    /// Returns an error if the hex is malformed or not a valid key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let mut bytes: [u8; 32] = hex::decode(secret_hex)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::KeyDerivation("Invalid secret key length".to_string()))?;

        let result = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        result
    }

    /// Imports an identity from an nsec (NIP-19 bech32 secret key).
    ///
    /// # Errors
    ///
    /// Returns an error if the nsec is malformed.
    pub fn from_nsec(nsec: &str) -> Result<Self> {
        let keys = Keys::parse(nsec).map_err(|e| CryptoError::Bech32(e.to_string()))?;

        Ok(Self {
            secret_bytes: keys.secret_key().secret_bytes(),
            pubkey_bytes: keys.public_key().to_bytes(),
        })
    }

    /// Exports the secret key as nsec. Only for user-initiated backup.
    ///
    /// # Errors
    ///
    /// Returns an error if bech32 encoding fails.
    pub fn export_nsec(&self) -> Result<String> {
        let secret_key = self.nostr_secret_key()?;
        secret_key
            .to_bech32()
            .map_err(|e| CryptoError::Bech32(e.to_string()))
    }

    /// Returns the public key as a 64-character hex string.
    #[must_use]
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey_bytes)
    }

    /// Returns the public key as npub.
    ///
    /// # Errors
    ///
    /// Returns an error if bech32 encoding fails.
    pub fn npub(&self) -> Result<String> {
        self.public_key()?
            .to_bech32()
            .map_err(|e| CryptoError::Bech32(e.to_string()))
    }

    /// Returns the raw public key bytes.
    #[must_use]
    pub const fn pubkey_bytes(&self) -> [u8; 32] {
        self.pubkey_bytes
    }

    /// Returns the public key as a `nostr` type.
    ///
    /// # Errors
    ///
    /// Returns an error if the cached bytes are not a valid x-only key.
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_slice(&self.pubkey_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Signs a 32-byte hash with BIP-340 Schnorr, returning 128 hex chars.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored secret cannot be reconstructed.
    pub fn sign(&self, message_hash: &[u8; 32]) -> Result<String> {
        let mut secret_bytes_copy = self.secret_bytes;

        let result = (|| {
            let secret_key = Secp256k1SecretKey::from_slice(&secret_bytes_copy)
                .map_err(|e| CryptoError::Signing(e.to_string()))?;

            let keypair = Keypair::from_secret_key(&SECP, &secret_key);
            let message = Message::from_digest(*message_hash);
            let signature = SECP.sign_schnorr(&message, &keypair);

            Ok(hex::encode(signature.serialize()))
        })();

        secret_bytes_copy.zeroize();

        result
    }

    /// Reconstructs the `nostr` secret key for shared-secret derivation.
    pub(crate) fn nostr_secret_key(&self) -> Result<NostrSecretKey> {
        let mut secret_bytes_copy = self.secret_bytes;
        let result = NostrSecretKey::from_slice(&secret_bytes_copy)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()));
        secret_bytes_copy.zeroize();
        result
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("pubkey", &self.pubkey_hex())
            .finish()
    }
}

/// Parses a hex or npub public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the key does not parse.
pub fn parse_public_key(key: &str) -> Result<PublicKey> {
    PublicKey::parse(key).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}
