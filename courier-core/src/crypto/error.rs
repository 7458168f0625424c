//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors raised by key handling and the crypto collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption operation failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Envelope signing failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Secret key bytes did not form a valid key.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// A public key could not be parsed.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Bech32 (npub/nsec) encoding or decoding failed.
    #[error("Bech32 error: {0}")]
    Bech32(String),
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_error_display() {
        let err = CryptoError::Encryption("bad key".to_string());
        assert_eq!(err.to_string(), "Encryption failed: bad key");
    }

    #[test]
    fn decryption_error_display() {
        let err = CryptoError::Decryption("invalid padding".to_string());
        assert_eq!(err.to_string(), "Decryption failed: invalid padding");
    }

    #[test]
    fn signing_error_display() {
        let err = CryptoError::Signing("no key".to_string());
        assert_eq!(err.to_string(), "Signing failed: no key");
    }

    #[test]
    fn invalid_public_key_display() {
        let err = CryptoError::InvalidPublicKey("zz".to_string());
        assert_eq!(err.to_string(), "Invalid public key: zz");
    }
}
