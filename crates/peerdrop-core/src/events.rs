//! Application-facing event stream.
//!
//! A [`SessionRegistry`](crate::SessionRegistry) reports everything the
//! surrounding application may want to render on a single unbounded stream.
//! File offers carry an [`OfferDecision`]: the transfer stays `Waiting` until
//! the application answers it, and dropping the decision counts as a reject.

use crate::error::Error;
use crate::peer::PeerState;
use crate::protocol::{FileId, FileOffer};
use crate::transfer::{Direction, TransferState};
use peerdrop_discovery::PeerId;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Sending half of the event stream
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event stream
pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Create a connected event sender/stream pair.
#[must_use]
pub fn event_channel() -> (EventSender, EventStream) {
    mpsc::unbounded_channel()
}

/// Events emitted by sessions and transfers
#[derive(Debug)]
pub enum Event {
    /// A peer session changed state
    PeerStateChanged {
        /// Remote peer
        peer: PeerId,
        /// New state
        state: PeerState,
    },

    /// Chat text received
    Text {
        /// Sender
        from: PeerId,
        /// Message body
        text: String,
    },

    /// A remote peer offered a file; answer through `decision`
    FileOffered {
        /// The offer
        offer: FileOffer,
        /// Accept/reject suspension point
        decision: OfferDecision,
    },

    /// Rate-limited progress update
    TransferProgress(TransferProgress),

    /// A transfer moved to `Paused`
    TransferPaused {
        /// Transfer
        file_id: FileId,
    },

    /// A paused transfer is moving again
    TransferResumed {
        /// Transfer
        file_id: FileId,
    },

    /// A transfer completed. Receive transfers carry the reassembled bytes.
    TransferCompleted {
        /// Transfer
        file_id: FileId,
        /// File name from the offer
        file_name: String,
        /// Send or receive
        direction: Direction,
        /// Reassembled content (receive side only)
        data: Option<Vec<u8>>,
    },

    /// A transfer failed
    TransferFailed {
        /// Transfer
        file_id: FileId,
        /// Cause
        error: Error,
    },

    /// A transfer was cancelled locally or by the remote side
    TransferCancelled {
        /// Transfer
        file_id: FileId,
    },
}

impl Event {
    /// Transfer this event refers to, if any
    #[must_use]
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Event::FileOffered { offer, .. } => Some(&offer.file_id),
            Event::TransferProgress(progress) => Some(&progress.file_id),
            Event::TransferPaused { file_id }
            | Event::TransferResumed { file_id }
            | Event::TransferCompleted { file_id, .. }
            | Event::TransferFailed { file_id, .. }
            | Event::TransferCancelled { file_id } => Some(file_id),
            Event::PeerStateChanged { .. } | Event::Text { .. } => None,
        }
    }
}

/// Progress snapshot for one transfer stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Transfer
    pub file_id: FileId,
    /// Remote peer of this stream
    pub peer: PeerId,
    /// Send or receive
    pub direction: Direction,
    /// Current transfer state
    pub state: TransferState,
    /// Bytes moved so far
    pub bytes: u64,
    /// File size
    pub total: u64,
    /// Integer percentage, 0-100
    pub percent: u8,
    /// Sliding-window throughput
    pub bytes_per_sec: f64,
    /// Estimated time remaining at the current throughput
    pub eta: Option<Duration>,
}

/// One-shot accept/reject answer for an incoming file offer.
///
/// Dropping the decision without answering rejects the offer.
#[derive(Debug)]
pub struct OfferDecision {
    tx: oneshot::Sender<bool>,
}

impl OfferDecision {
    pub(crate) fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Accept the offer
    pub fn accept(self) {
        let _ = self.tx.send(true);
    }

    /// Reject the offer
    pub fn reject(self) {
        let _ = self.tx.send(false);
    }

    /// Answer with a boolean
    pub fn decide(self, accept: bool) {
        let _ = self.tx.send(accept);
    }
}
