//! # peerdrop core
//!
//! Peer session lifecycle and resumable chunked file transfer for peers that
//! meet in a relay room and talk over direct channels.
//!
//! This crate provides:
//! - Per-peer session actors with liveness probing, keepalives, key exchange
//!   and roster-gated exponential-backoff reconnects
//! - A tagged control-message protocol with an optional encrypted envelope
//! - Resumable chunked transfers to many peers at once, with backpressure,
//!   receiver-driven resend requests and digest verification
//! - A [`SessionRegistry`] tying roster, sessions and transfers together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SessionRegistry                            │
//! │   (roster, envelope routing, application operations)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       TransferManager                            │
//! │   (offers, per-peer chunk pumps, reassembly, progress)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       PeerSession                                │
//! │   (negotiation, key exchange, probe, keepalive, backoff)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │            SignalingClient          │       ChannelFactory       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod roster;
pub mod transfer;

pub use config::{Config, PeerConfig, TransferConfig};
pub use error::{Error, Result};
pub use events::{Event, EventSender, EventStream, OfferDecision, TransferProgress};
pub use peer::{PeerLink, PeerState};
pub use protocol::{ControlMessage, FileId, FileOffer};
pub use registry::SessionRegistry;
pub use roster::Roster;
pub use transfer::{
    ChunkSource, Direction, FileSource, MemorySource, TransferManager, TransferSnapshot,
    TransferState,
};

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
