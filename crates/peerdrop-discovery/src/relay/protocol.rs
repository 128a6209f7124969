//! Relay protocol message definitions.
//!
//! Messages are JSON objects tagged by `type`, matching what a websocket
//! rendezvous server exchanges with browser clients.

use crate::signaling::{SignalingError, SignalingEvent};
use crate::{Member, PeerId};
use serde::{Deserialize, Serialize};

/// Relay protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Client asks to join a room (leaving any previous room)
    JoinRoom {
        /// Room to join
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Relay confirms a join and reports the roster
    RoomJoined {
        /// Joined room
        #[serde(rename = "roomId")]
        room_id: String,
        /// Members including the joiner
        members: Vec<Member>,
    },

    /// Roster changed
    RoomUsersUpdated {
        /// Current roster
        members: Vec<Member>,
    },

    /// A new member entered the room
    UserConnected(Member),

    /// A member left the room
    UserDisconnected {
        /// Departed member
        id: PeerId,
    },

    /// Client asks the relay to forward a signal
    Relay {
        /// Destination peer
        to: PeerId,
        /// Opaque payload
        signal: serde_json::Value,
    },

    /// Relay delivers a forwarded signal
    Signal {
        /// Originating peer
        from: PeerId,
        /// Opaque payload
        signal: serde_json::Value,
    },

    /// Relay error response
    Error {
        /// Human-readable error message
        message: String,
    },
}

impl RelayMessage {
    /// Serialize message to a JSON string
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    /// Deserialize message from a JSON string
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Serialization` if the text is not a relay message.
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::JoinRoom { .. } => "join-room",
            RelayMessage::RoomJoined { .. } => "room-joined",
            RelayMessage::RoomUsersUpdated { .. } => "room-users-updated",
            RelayMessage::UserConnected(_) => "user-connected",
            RelayMessage::UserDisconnected { .. } => "user-disconnected",
            RelayMessage::Relay { .. } => "relay",
            RelayMessage::Signal { .. } => "signal",
            RelayMessage::Error { .. } => "error",
        }
    }

    /// Translate a relay-to-client message into a session-layer event.
    ///
    /// Client-to-relay messages and errors have no event form.
    #[must_use]
    pub fn into_event(self) -> Option<SignalingEvent> {
        match self {
            RelayMessage::RoomJoined { room_id, members } => {
                Some(SignalingEvent::RoomJoined { room_id, members })
            }
            RelayMessage::RoomUsersUpdated { members } => {
                Some(SignalingEvent::RosterUpdated { members })
            }
            RelayMessage::UserConnected(member) => Some(SignalingEvent::PeerJoined(member)),
            RelayMessage::UserDisconnected { id } => Some(SignalingEvent::PeerLeft { id }),
            RelayMessage::Signal { from, signal } => Some(SignalingEvent::Envelope {
                from,
                payload: signal,
            }),
            RelayMessage::JoinRoom { .. } | RelayMessage::Relay { .. } | RelayMessage::Error { .. } => {
                None
            }
        }
    }
}
