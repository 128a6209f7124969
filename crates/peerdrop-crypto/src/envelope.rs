//! Encrypt-before-send / decrypt-after-receive envelope.
//!
//! Each side of a channel creates a [`KeyAgreement`], sends its public key in
//! the clear, and calls [`KeyAgreement::complete`] with the peer's key. Both
//! sides end up with the same [`EnvelopeCipher`]: the X25519 shared secret and
//! both public keys (in a canonical order) go through the BLAKE3 KDF.
//!
//! Every sealed message carries its own random 24-byte nonce, exposed as the
//! envelope `iv`.

use crate::CryptoError;
use crate::aead::{AeadKey, Nonce};
use crate::hash::derive_key;
use crate::x25519::{PublicKey, Secret};

const ENVELOPE_KDF_CONTEXT: &str = "peerdrop 2024 channel envelope key";
const ENVELOPE_AAD: &[u8] = b"peerdrop-envelope";

/// Ephemeral key agreement state for one channel.
pub struct KeyAgreement {
    secret: Secret,
    public: PublicKey,
}

impl KeyAgreement {
    /// Generate a fresh ephemeral key pair.
    #[must_use]
    pub fn new() -> Self {
        let secret = Secret::random();
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Local public key, sent to the peer in the clear.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Derive the envelope cipher from the peer's public key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` for a low-order peer key.
    pub fn complete(&self, remote: &PublicKey) -> Result<EnvelopeCipher, CryptoError> {
        let shared = self.secret.agree(remote)?;

        let local_bytes = self.public.to_bytes();
        let remote_bytes = remote.to_bytes();
        let (first, second) = if local_bytes <= remote_bytes {
            (local_bytes, remote_bytes)
        } else {
            (remote_bytes, local_bytes)
        };

        let mut ikm = Vec::with_capacity(96);
        ikm.extend_from_slice(shared.as_slice());
        ikm.extend_from_slice(&first);
        ikm.extend_from_slice(&second);

        let key = derive_key(ENVELOPE_KDF_CONTEXT, &ikm);
        Ok(EnvelopeCipher {
            key: AeadKey::new(key),
        })
    }
}

impl Default for KeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

/// A sealed message: ciphertext (with tag) plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext with appended authentication tag
    pub ciphertext: Vec<u8>,
    /// Nonce
    pub iv: Vec<u8>,
}

/// Symmetric envelope cipher shared by both ends of a channel.
#[derive(Clone)]
pub struct EnvelopeCipher {
    key: AeadKey,
}

impl EnvelopeCipher {
    /// Wrap an existing key.
    #[must_use]
    pub fn from_key(key: AeadKey) -> Self {
        Self { key }
    }

    /// Seal a plaintext under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let nonce = Nonce::random();
        let ciphertext = self.key.encrypt(&nonce, plaintext, ENVELOPE_AAD)?;
        Ok(Sealed {
            ciphertext,
            iv: nonce.as_bytes().to_vec(),
        })
    }

    /// Open a sealed message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidNonceLength` for a malformed `iv` and
    /// `CryptoError::DecryptionFailed` on authentication failure.
    pub fn open(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::from_slice(iv)?;
        self.key.decrypt(&nonce, ciphertext, ENVELOPE_AAD)
    }
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeCipher(..)")
    }
}
