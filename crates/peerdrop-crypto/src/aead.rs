//! `XChaCha20-Poly1305` sealing for channel envelopes.
//!
//! Nonces are 192 bits, so a fresh random nonce per envelope is safe for the
//! lifetime of a channel key. The 16-byte tag is appended to the ciphertext.

use crate::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Nonce (envelope `iv`) size in bytes.
pub const NONCE_SIZE: usize = 24;

/// Key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Per-envelope nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Fresh random nonce from the OS generator.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a received `iv`.
    ///
    /// # Errors
    ///
    /// `CryptoError::InvalidNonceLength` unless `iv` is exactly
    /// [`NONCE_SIZE`] bytes.
    pub fn from_slice(iv: &[u8]) -> Result<Self, CryptoError> {
        <[u8; NONCE_SIZE]>::try_from(iv)
            .map(Self)
            .map_err(|_| CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: iv.len(),
            })
    }

    /// Raw nonce bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Symmetric channel key, wiped on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap derived key material.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    /// Seal `plaintext`, binding `aad`. Returns ciphertext plus tag.
    ///
    /// # Errors
    ///
    /// `CryptoError::EncryptionFailed` if the cipher refuses the input.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload { msg: plaintext, aad };
        self.cipher()
            .encrypt(XNonce::from_slice(nonce.as_bytes()), payload)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open a sealed payload.
    ///
    /// # Errors
    ///
    /// `CryptoError::DecryptionFailed` if the input is shorter than a tag or
    /// fails authentication.
    pub fn decrypt(&self, nonce: &Nonce, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let payload = Payload { msg: sealed, aad };
        self.cipher()
            .decrypt(XNonce::from_slice(nonce.as_bytes()), payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
