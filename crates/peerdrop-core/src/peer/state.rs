//! Peer session connection states.

use std::fmt;

/// Connection state of a [`PeerSession`](super::PeerSessionHandle).
///
/// ```text
/// Idle -> Connecting -> KeyExchange -> Connected
///             ^              |              |
///             |              v              v
///             +---------- Disconnected <----+
///                            |
///                            v
///                          Failed   (retries exhausted, manual retry only)
///
/// any state -> Gone  (peer left the roster)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Created, nothing attempted yet
    Idle,
    /// Negotiating a channel, or probing an open channel without encryption
    Connecting,
    /// Channel open; exchanging public keys and probing liveness
    KeyExchange,
    /// Liveness proven; traffic flows
    Connected,
    /// Channel lost; a retry may be scheduled
    Disconnected,
    /// Automatic retries exhausted while the peer is still in the roster
    Failed,
    /// Peer left the roster; terminal
    Gone,
}

impl PeerState {
    /// Whether the session can never leave this state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == PeerState::Gone
    }

    /// Whether a connection attempt is in progress
    #[must_use]
    pub fn is_negotiating(self) -> bool {
        matches!(self, PeerState::Connecting | PeerState::KeyExchange)
    }

    /// Lowercase name used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Idle => "idle",
            PeerState::Connecting => "connecting",
            PeerState::KeyExchange => "key-exchange",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Gone => "gone",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
