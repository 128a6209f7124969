//! # peerdrop Discovery
//!
//! Rendezvous layer for peerdrop.
//!
//! This crate provides:
//! - [`PeerId`], the opaque identifier a rendezvous service assigns to each
//!   roster member for the lifetime of its membership
//! - The [`SignalingClient`] contract consumed by the session layer: joining a
//!   room, roster notifications, and opaque envelope forwarding
//! - An in-memory room relay ([`relay::RelayHub`] + [`relay::RelayClient`])
//!   with the same semantics as a websocket rendezvous server
//!
//! ## Room relay
//!
//! ```text
//!   peer A                  RelayHub                   peer B
//!     |--- join-room r ------->|                          |
//!     |<-- room-joined --------|                          |
//!     |                        |<------- join-room r -----|
//!     |<-- user-connected B ---|--- room-joined --------->|
//!     |<-- room-users-updated -|--- room-users-updated -->|
//!     |--- relay{to:B} ------->|--- signal{from:A} ------>|
//! ```
//!
//! The relay never inspects envelope payloads.
//!
//! ## Example
//!
//! ```rust,no_run
//! use peerdrop_discovery::relay::{RelayClient, RelayHub};
//! use peerdrop_discovery::SignalingClient;
//!
//! # async fn example() -> peerdrop_discovery::SignalingResult<()> {
//! let hub = RelayHub::new();
//! let (client, mut events) = RelayClient::connect(&hub, "alice").await?;
//! client.join_room("lobby").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod relay;
pub mod signaling;

pub use signaling::{
    SignalingClient, SignalingError, SignalingEvent, SignalingEvents, SignalingResult,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque peer identifier assigned by the rendezvous service.
///
/// Identifiers are compared lexicographically; the ordering is used to break
/// negotiation glare between two peers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier (16 lowercase hex characters).
    #[must_use]
    pub fn random() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A roster entry: the relay-assigned peer id plus the user-chosen name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Relay-assigned identifier
    pub id: PeerId,
    /// Display name chosen by the user
    pub user_id: String,
}

impl Member {
    /// Create a roster entry.
    #[must_use]
    pub fn new(id: impl Into<PeerId>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        let a = PeerId::from("abc");
        let b = PeerId::from("abd");
        let c = PeerId::from("b");

        assert!(a < b);
        assert!(b < c);
        assert!(PeerId::from("10") < PeerId::from("9"));
    }

    #[test]
    fn test_peer_id_short() {
        assert_eq!(PeerId::from("0123456789abcdef").short(), "01234567");
        assert_eq!(PeerId::from("abc").short(), "abc");
    }

    #[test]
    fn test_random_peer_ids_differ() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_member_wire_shape() {
        let member = Member::new("p1", "alice");
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json, serde_json::json!({"id": "p1", "userId": "alice"}));
    }
}
