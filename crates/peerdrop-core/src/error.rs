//! Error types for peer sessions and transfers
//!
//! Errors are categorized to drive retry logic:
//!
//! - **Transient**: the session layer retries automatically with backoff
//!   (negotiation timeouts, channel closure, key exchange failure)
//! - **Permanent**: surfaced to the caller immediately and never retried
//!   (integrity mismatch, capacity, unknown ids, invalid configuration)
//!
//! Duplicate chunks and duplicate offers are not errors; the receive path
//! ignores them and reports them through its outcome types.
//!
//! # Example
//!
//! ```no_run
//! use peerdrop_core::Error;
//!
//! fn handle_error(err: Error) {
//!     if err.is_transient() {
//!         println!("Will be retried: {err}");
//!     } else {
//!         println!("Needs attention: {err}");
//!     }
//! }
//! ```

use peerdrop_crypto::CryptoError;
use peerdrop_discovery::{PeerId, SignalingError};
use peerdrop_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in session and transfer operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    // ============ Session Errors ============
    /// No liveness within the connection or probe window
    #[error("Negotiation timed out: {0}")]
    NegotiationTimeout(Cow<'static, str>),

    /// Channel closed or errored
    #[error("Channel closed: {0}")]
    ChannelClosed(Cow<'static, str>),

    /// Public key exchange or envelope decryption failed
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailure(Cow<'static, str>),

    /// No session exists for the peer
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// No connected peer to offer a file to
    #[error("No connected peers")]
    NoConnectedPeers,

    // ============ Transfer Errors ============
    /// Reassembled content does not match the offered digest
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Digest from the offer
        expected: String,
        /// Digest of the reassembled bytes
        actual: String,
    },

    /// File too large or too many concurrent transfers
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(Cow<'static, str>),

    /// Transfer not found
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // ============ Protocol Errors ============
    /// Control message with an unrecognized `type`
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Malformed frame or message
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    // ============ Collaborator Errors ============
    /// Signaling relay failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Returns true if this error is transient and handled by the
    /// reconnect path
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NegotiationTimeout(_)
                | Error::ChannelClosed(_)
                | Error::KeyExchangeFailure(_)
                | Error::Transport(_)
                | Error::Signaling(_)
        )
    }

    /// Returns true if this error is permanent and must be surfaced
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::IntegrityMismatch { .. }
                | Error::CapacityExceeded(_)
                | Error::TransferNotFound(_)
                | Error::PeerNotFound(_)
                | Error::NoConnectedPeers
                | Error::InvalidConfig(_)
                | Error::InvalidState(_)
        )
    }

    /// Create a negotiation timeout error with static context (zero allocation)
    #[must_use]
    pub const fn negotiation_timeout(context: &'static str) -> Self {
        Error::NegotiationTimeout(Cow::Borrowed(context))
    }

    /// Create a channel closed error with static context (zero allocation)
    #[must_use]
    pub const fn channel_closed(context: &'static str) -> Self {
        Error::ChannelClosed(Cow::Borrowed(context))
    }

    /// Create a key exchange error with static context (zero allocation)
    #[must_use]
    pub const fn key_exchange(context: &'static str) -> Self {
        Error::KeyExchangeFailure(Cow::Borrowed(context))
    }

    /// Create a capacity error with static context (zero allocation)
    #[must_use]
    pub const fn capacity(context: &'static str) -> Self {
        Error::CapacityExceeded(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        Error::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Error::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(Cow::Owned(err.to_string()))
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
