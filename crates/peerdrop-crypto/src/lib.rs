//! # peerdrop Crypto
//!
//! Cryptographic primitives for peerdrop.
//!
//! This crate provides:
//! - Ephemeral X25519 key agreement per channel
//! - `XChaCha20-Poly1305` envelope encryption with random nonces
//! - BLAKE3 content digests (streamed) and key derivation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | BLAKE3 derive_key | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod x25519;

pub use envelope::{EnvelopeCipher, KeyAgreement, Sealed};
pub use error::CryptoError;
pub use hash::{ContentHasher, digest_hex};
pub use x25519::PublicKey;
