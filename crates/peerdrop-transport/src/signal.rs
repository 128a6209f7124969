//! Negotiation signals exchanged through the rendezvous relay.
//!
//! Every negotiation attempt carries a random [`NegotiationId`]; signals for a
//! negotiation that is no longer current are ignored by the receiver.

use serde::{Deserialize, Serialize};

/// Identifier of a single negotiation attempt
pub type NegotiationId = u64;

/// Offer/answer/candidate fragments. Travels as the payload of a signaling
/// envelope: `{"type":"offer","negotiationId":..,"sdp":".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// Session description offered by the initiating side
    Offer {
        /// Negotiation attempt
        #[serde(rename = "negotiationId")]
        negotiation_id: NegotiationId,
        /// Opaque session description
        sdp: String,
    },
    /// Session description answering an offer
    Answer {
        /// Negotiation attempt
        #[serde(rename = "negotiationId")]
        negotiation_id: NegotiationId,
        /// Opaque session description
        sdp: String,
    },
    /// Connectivity candidate
    Candidate {
        /// Negotiation attempt
        #[serde(rename = "negotiationId")]
        negotiation_id: NegotiationId,
        /// Opaque candidate line
        candidate: String,
    },
}

impl Signal {
    /// Negotiation this signal belongs to
    #[must_use]
    pub fn negotiation_id(&self) -> NegotiationId {
        match self {
            Signal::Offer { negotiation_id, .. }
            | Signal::Answer { negotiation_id, .. }
            | Signal::Candidate { negotiation_id, .. } => *negotiation_id,
        }
    }

    /// Signal kind name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }

    /// Encode as an envelope payload
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode from an envelope payload; `None` if the payload is not a signal.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        Signal::deserialize(value).ok()
    }
}

/// Generate a fresh negotiation id.
#[must_use]
pub fn new_negotiation_id() -> NegotiationId {
    rand::random()
}
