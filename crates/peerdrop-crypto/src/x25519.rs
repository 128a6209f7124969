//! X25519 key agreement for channel envelopes.

use crate::CryptoError;
use rand_core::OsRng;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

/// Encoded public key length in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Per-channel secret scalar. Wiped on drop by `x25519-dalek`.
pub(crate) struct Secret(StaticSecret);

impl Secret {
    pub(crate) fn random() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Shared secret with `remote`. Non-contributory results (low-order
    /// points) are refused.
    pub(crate) fn agree(&self, remote: &PublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.0.diffie_hellman(&remote.0);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

/// Public half of a channel key pair, exchanged as lowercase hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    /// Raw key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Key from raw bytes. Any 32 bytes are accepted here; low-order
    /// points fail later in key agreement.
    #[must_use]
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes.into())
    }

    /// Wire encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Parse a key received in a `key` message.
    ///
    /// # Errors
    ///
    /// `CryptoError::InvalidPublicKey` for malformed hex,
    /// `CryptoError::InvalidKeyLength` when it does not decode to 32 bytes.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(text).map_err(|_| CryptoError::InvalidPublicKey)?;
        match <[u8; PUBLIC_KEY_SIZE]>::try_from(raw.as_slice()) {
            Ok(bytes) => Ok(Self::from_bytes(bytes)),
            Err(_) => Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: raw.len(),
            }),
        }
    }
}
