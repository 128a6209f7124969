//! # peerdrop Transport
//!
//! Peer channel layer for peerdrop.
//!
//! The session layer never talks to a concrete data-channel implementation.
//! It consumes two contracts:
//!
//! - [`ChannelFactory`]: starts outbound negotiations (`open`) and answers
//!   remote offers (`on_incoming`)
//! - [`Channel`]: send, buffered-amount accounting, and application of remote
//!   negotiation [`Signal`]s, with lifecycle and inbound traffic delivered as
//!   [`ChannelEvent`]s
//!
//! ## Negotiation
//!
//! ```text
//!   offerer                         relay                         answerer
//!   factory.open(B) --Signal(Offer)--> ... --> factory.on_incoming(A, offer)
//!   apply_signal(answer) <-- ... <--Signal(Answer)--
//!   apply_signal(cand)   <-- ... <--Signal(Candidate)--
//!   ChannelEvent::Open                                        ChannelEvent::Open
//! ```
//!
//! [`memory`] provides an in-process implementation used by tests and the
//! demo CLI.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod factory;
pub mod memory;
pub mod signal;

pub use channel::{
    Channel, ChannelEvent, ChannelEvents, ChannelHandle, ChannelState, ChannelStats, Frame,
    TransportError, TransportResult,
};
pub use factory::ChannelFactory;
pub use memory::{LinkConfig, MemoryChannel, MemoryChannelFactory, MemoryNetwork};
pub use signal::{NegotiationId, Signal, new_negotiation_id};
