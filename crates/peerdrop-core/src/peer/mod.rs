//! Peer sessions.
//!
//! One [`PeerSession`](session) task runs per remote peer and owns all of
//! that peer's connection state: the current channel, retry/backoff, the
//! liveness probe, keepalives, and the key exchange. Everything that can
//! change a session (relay signals, channel events, timers, manual retries,
//! roster departures) funnels into that one task, so transitions for a given
//! peer are strictly serialized.
//!
//! Application traffic is handed to a [`PeerHandler`] (the transfer manager)
//! once decoded.

mod backoff;
mod health;
mod link;
mod session;
mod state;

pub use backoff::Backoff;
pub use health::{KeepaliveMonitor, KeepaliveVerdict};
pub use link::{ChunkEncoding, PeerLink};
pub use session::{PeerSessionHandle, SessionContext, SessionSnapshot};
pub use state::PeerState;

#[cfg(test)]
pub(crate) use link::testing;

use crate::protocol::{ControlMessage, FileId};
use async_trait::async_trait;
use peerdrop_discovery::PeerId;

/// Metadata of one received chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Transfer
    pub file_id: FileId,
    /// Chunk index
    pub chunk_index: u64,
    /// Chunk count announced by the sender
    pub total_chunks: u64,
}

/// Receives session lifecycle changes and decoded application traffic.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// The session to `link.peer()` proved liveness.
    async fn on_connected(&self, link: PeerLink);

    /// The session to `peer` lost its channel.
    async fn on_disconnected(&self, peer: &PeerId);

    /// A transfer control message arrived from `peer`.
    async fn on_message(&self, peer: &PeerId, message: ControlMessage);

    /// A chunk payload arrived from `peer`.
    async fn on_chunk(&self, peer: &PeerId, header: ChunkHeader, data: Vec<u8>);
}
