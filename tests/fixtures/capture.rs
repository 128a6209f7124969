//! Channel that records outbound frames instead of delivering them
//!
//! Lets a test drive a [`TransferManager`](peerdrop_core::TransferManager)
//! through its [`PeerHandler`](peerdrop_core::peer::PeerHandler) side and
//! then inspect exactly what it put on the wire.

use async_trait::async_trait;
use peerdrop_core::ControlMessage;
use peerdrop_core::protocol::WireMessage;
use peerdrop_discovery::PeerId;
use peerdrop_transport::{
    Channel, ChannelState, Frame, NegotiationId, Signal, TransportError, TransportResult,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Open channel to `peer` that keeps every frame sent on it
pub struct CaptureChannel {
    peer: PeerId,
    state: AtomicU8,
    threshold: AtomicUsize,
    frames: Mutex<Vec<Frame>>,
}

impl CaptureChannel {
    /// Open capture channel to `peer`
    pub fn new(peer: &str) -> Self {
        Self {
            peer: PeerId::from(peer),
            state: AtomicU8::new(ChannelState::Open as u8),
            threshold: AtomicUsize::new(0),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Every frame sent so far
    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    /// Plain control messages among the captured text frames
    pub fn messages(&self) -> Vec<ControlMessage> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => match WireMessage::parse(&text) {
                    Ok(WireMessage::Plain(message)) => Some(message),
                    _ => None,
                },
                Frame::Binary(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Channel for CaptureChannel {
    fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    fn negotiation_id(&self) -> NegotiationId {
        1
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn has_remote_description(&self) -> bool {
        true
    }

    async fn apply_signal(&self, _signal: Signal) -> TransportResult<()> {
        Ok(())
    }

    async fn send(&self, frame: Frame) -> TransportResult<()> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::Closed);
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    fn set_buffered_amount_low_threshold(&self, bytes: usize) {
        self.threshold.store(bytes, Ordering::Release);
    }

    async fn close(&self) {
        self.state
            .store(ChannelState::Closed as u8, Ordering::Release);
    }
}
