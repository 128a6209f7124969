//! Channel factory contract wrapping the negotiation primitive.

use crate::channel::{ChannelHandle, TransportResult};
use crate::signal::Signal;
use async_trait::async_trait;
use peerdrop_discovery::PeerId;

/// Creates channels to remote peers.
///
/// Both sides of a negotiation exchange [`Signal`]s through the rendezvous
/// relay: local output appears as [`ChannelEvent::Signal`] on the handle's
/// event stream, remote input is fed back with
/// [`Channel::apply_signal`](crate::Channel::apply_signal).
///
/// [`ChannelEvent::Signal`]: crate::ChannelEvent::Signal
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Begin an outbound negotiation with `peer`. The offer is the first
    /// event on the returned handle.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the negotiation cannot be started.
    async fn open(&self, peer: &PeerId) -> TransportResult<ChannelHandle>;

    /// Answer a remote `offer` from `peer`. The answer is the first event on
    /// the returned handle.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if `offer` is not an offer or cannot be
    /// answered.
    async fn on_incoming(&self, peer: &PeerId, offer: Signal) -> TransportResult<ChannelHandle>;
}
