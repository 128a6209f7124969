//! BLAKE3 file digests (the offer `hash` field) and envelope key derivation.

/// Lowercase hex BLAKE3 digest of a whole buffer.
#[must_use]
pub fn digest_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Streaming digest for sources read chunk by chunk.
#[derive(Default)]
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    /// Empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    /// Same value [`digest_hex`] gives for the concatenated chunks.
    #[must_use]
    pub fn finalize_hex(&self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

pub(crate) fn derive_key(context: &str, ikm: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, ikm)
}
