//! Signaling client contract.
//!
//! The session layer consumes rendezvous services only through
//! [`SignalingClient`] and the [`SignalingEvent`] stream returned when a client
//! connects. Envelope payloads are opaque JSON values: the relay forwards
//! them without looking inside.

use crate::{Member, PeerId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalingError {
    /// Client is not connected to the relay
    #[error("Not connected to relay")]
    NotConnected,

    /// Client has not joined a room yet
    #[error("Not in a room")]
    NotInRoom,

    /// Destination peer is unknown to the relay
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Relay rejected or failed to deliver a message
    #[error("Relay error: {0}")]
    Relay(String),

    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for signaling operations
pub type SignalingResult<T> = Result<T, SignalingError>;

/// Inbound notifications from the rendezvous service.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// The local client joined a room; `members` includes the local peer.
    RoomJoined {
        /// Room identifier
        room_id: String,
        /// Full roster at join time
        members: Vec<Member>,
    },
    /// Full replacement of the room roster.
    RosterUpdated {
        /// Current roster
        members: Vec<Member>,
    },
    /// A peer entered the room.
    PeerJoined(Member),
    /// A peer left the room or disconnected from the relay.
    PeerLeft {
        /// Departed peer
        id: PeerId,
    },
    /// An opaque envelope forwarded from another peer.
    Envelope {
        /// Sender
        from: PeerId,
        /// Opaque payload
        payload: serde_json::Value,
    },
}

/// Receiving half of a signaling client's event stream.
pub type SignalingEvents = mpsc::UnboundedReceiver<SignalingEvent>;

/// Rendezvous operations used by the session layer.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Identifier the relay assigned to this client.
    fn local_id(&self) -> &PeerId;

    /// Join (or switch to) a room.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` if the relay is unreachable.
    async fn join_room(&self, room_id: &str) -> SignalingResult<()>;

    /// Forward an opaque envelope to another peer.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` if the relay is unreachable or rejects the
    /// destination.
    async fn send_envelope(&self, to: &PeerId, payload: serde_json::Value) -> SignalingResult<()>;
}
