//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid nonce length
    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Peer public key produced a degenerate shared secret
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Envelope used before key agreement finished
    #[error("key agreement not complete")]
    KeyAgreementIncomplete,
}
