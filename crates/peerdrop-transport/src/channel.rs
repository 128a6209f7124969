//! Channel trait abstraction over browser-style peer data channels.
//!
//! A [`Channel`] is a bidirectional message pipe between two peers once
//! negotiation completes. Its lifecycle and inbound traffic are reported as
//! [`ChannelEvent`]s on the stream handed out with it in a [`ChannelHandle`];
//! sending is a direct method call. Outbound bytes that the transport has
//! accepted but not yet put on the wire are reported by
//! [`Channel::buffered_amount`], and a [`ChannelEvent::BufferedAmountLow`]
//! fires when that figure falls to or below the configured threshold.

use crate::signal::{NegotiationId, Signal};
use async_trait::async_trait;
use peerdrop_discovery::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Channel is closed
    #[error("Channel is closed")]
    Closed,

    /// Negotiation could not produce a channel
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Operation not valid in the channel's current state
    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A single channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Negotiation in progress
    Connecting = 0,
    /// Ready for traffic
    Open = 1,
    /// Closed locally or by the peer
    Closed = 2,
}

impl ChannelState {
    /// Decode from the `repr(u8)` discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }
}

/// Events reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Local negotiation output (offer, answer, candidate) that must be
    /// forwarded to the remote peer through signaling
    Signal(Signal),
    /// Channel is open
    Open,
    /// Inbound message
    Message(Frame),
    /// Buffered outbound bytes dropped to or below the low threshold
    BufferedAmountLow,
    /// Channel closed
    Closed,
    /// Transport error; usually followed by `Closed`
    Error(String),
}

/// Receiving half of a channel's event stream.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// A channel together with its event stream.
pub struct ChannelHandle {
    /// The channel
    pub channel: Arc<dyn Channel>,
    /// Events for this channel only
    pub events: ChannelEvents,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("peer", self.channel.peer_id())
            .field("negotiation_id", &self.channel.negotiation_id())
            .field("state", &self.channel.state())
            .finish()
    }
}

/// Async peer channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Remote peer this channel is (being) negotiated with.
    fn peer_id(&self) -> &PeerId;

    /// Negotiation this channel belongs to.
    fn negotiation_id(&self) -> NegotiationId;

    /// Current lifecycle state.
    fn state(&self) -> ChannelState;

    /// Whether a remote description has been applied. Candidates must not be
    /// applied before this is true.
    fn has_remote_description(&self) -> bool;

    /// Apply a remote answer or candidate for this negotiation.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidState` for a candidate applied before
    /// the remote description or a signal for another negotiation.
    async fn apply_signal(&self, signal: Signal) -> TransportResult<()>;

    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` unless the channel is open.
    async fn send(&self, frame: Frame) -> TransportResult<()>;

    /// Outbound bytes accepted but not yet delivered.
    fn buffered_amount(&self) -> usize;

    /// Threshold for [`ChannelEvent::BufferedAmountLow`].
    fn buffered_amount_low_threshold(&self) -> usize;

    /// Set the threshold for [`ChannelEvent::BufferedAmountLow`].
    fn set_buffered_amount_low_threshold(&self, bytes: usize);

    /// Close the channel. Idempotent.
    async fn close(&self);

    /// Channel statistics (optional).
    fn stats(&self) -> ChannelStats {
        ChannelStats::default()
    }
}

/// Channel statistics
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Largest buffered amount observed right after a send
    pub peak_buffered: usize,
}

impl ChannelStats {
    /// Record a send and the buffered amount it produced
    pub fn record_send(&mut self, bytes: usize, buffered_after: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
        self.peak_buffered = self.peak_buffered.max(buffered_after);
    }

    /// Record a receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(Frame::Text("hello".into()).len(), 5);
        assert_eq!(Frame::Binary(vec![0; 16]).len(), 16);
        assert!(Frame::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn test_channel_state_round_trip() {
        for state in [ChannelState::Connecting, ChannelState::Open, ChannelState::Closed] {
            assert_eq!(ChannelState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_channel_stats() {
        let mut stats = ChannelStats::default();
        stats.record_send(100, 100);
        stats.record_send(50, 60);
        stats.record_recv(200);

        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.peak_buffered, 100);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.frames_received, 1);
    }
}
