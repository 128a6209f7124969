//! Room-based relay for signaling between peers.
//!
//! [`RelayHub`] plays the rendezvous server, [`RelayClient`] implements
//! [`SignalingClient`](crate::SignalingClient) against it.

pub mod client;
pub mod hub;
pub mod protocol;

pub use client::{RelayClient, RelayClientState, next_matching};
pub use hub::RelayHub;
pub use protocol::RelayMessage;
