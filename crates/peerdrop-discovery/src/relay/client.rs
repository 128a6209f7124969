//! Relay client implementation for talking to a [`RelayHub`].

use super::hub::RelayHub;
use super::protocol::RelayMessage;
use crate::PeerId;
use crate::signaling::{
    SignalingClient, SignalingError, SignalingEvent, SignalingEvents, SignalingResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

/// Relay client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayClientState {
    /// Attached but not in a room
    Connected,
    /// Member of a room
    InRoom,
    /// Detached from the relay
    Disconnected,
}

/// Relay client for communicating with a relay hub
pub struct RelayClient {
    /// Relay-assigned identifier
    id: PeerId,
    /// Hub handle
    hub: RelayHub,
    /// Current client state
    state: Arc<RwLock<RelayClientState>>,
    /// Task translating relay messages into signaling events
    pump: JoinHandle<()>,
}

impl RelayClient {
    /// Attach to a hub under a fresh random id.
    ///
    /// Returns the client and its signaling event stream.
    ///
    /// # Errors
    ///
    /// Infallible for the in-memory hub; the signature matches networked
    /// relays.
    pub async fn connect(
        hub: &RelayHub,
        user_id: &str,
    ) -> SignalingResult<(Self, SignalingEvents)> {
        let (id, rx) = hub.attach(user_id).await;
        Ok(Self::start(hub.clone(), id, rx))
    }

    /// Attach to a hub under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Infallible for the in-memory hub; the signature matches networked
    /// relays.
    pub async fn connect_as(
        hub: &RelayHub,
        id: PeerId,
        user_id: &str,
    ) -> SignalingResult<(Self, SignalingEvents)> {
        let rx = hub.attach_as(id.clone(), user_id).await;
        Ok(Self::start(hub.clone(), id, rx))
    }

    fn start(
        hub: RelayHub,
        id: PeerId,
        mut rx: mpsc::UnboundedReceiver<RelayMessage>,
    ) -> (Self, SignalingEvents) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(RelayClientState::Connected));

        let pump_id = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let RelayMessage::Error { message } = &msg {
                    tracing::warn!(peer = %pump_id, "Relay error: {}", message);
                    continue;
                }
                let Some(event) = msg.into_event() else {
                    continue;
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            tracing::debug!(peer = %pump_id, "Relay receive loop ended");
        });

        (
            Self {
                id,
                hub,
                state,
                pump,
            },
            event_rx,
        )
    }

    /// Current client state
    pub async fn state(&self) -> RelayClientState {
        *self.state.read().await
    }

    /// Detach from the hub. Other room members observe a departure.
    pub async fn disconnect(&self) {
        *self.state.write().await = RelayClientState::Disconnected;
        self.hub.detach(&self.id).await;
        self.pump.abort();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl SignalingClient for RelayClient {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    async fn join_room(&self, room_id: &str) -> SignalingResult<()> {
        if self.state().await == RelayClientState::Disconnected {
            return Err(SignalingError::NotConnected);
        }
        self.hub
            .handle(
                &self.id,
                RelayMessage::JoinRoom {
                    room_id: room_id.to_owned(),
                },
            )
            .await?;
        *self.state.write().await = RelayClientState::InRoom;
        Ok(())
    }

    async fn send_envelope(&self, to: &PeerId, payload: serde_json::Value) -> SignalingResult<()> {
        match self.state().await {
            RelayClientState::Disconnected => return Err(SignalingError::NotConnected),
            RelayClientState::Connected => return Err(SignalingError::NotInRoom),
            RelayClientState::InRoom => {}
        }
        self.hub
            .handle(
                &self.id,
                RelayMessage::Relay {
                    to: to.clone(),
                    signal: payload,
                },
            )
            .await
    }
}

/// Convenience for tests and demos: wait for the next event matching `pred`.
pub async fn next_matching<F>(events: &mut SignalingEvents, mut pred: F) -> Option<SignalingEvent>
where
    F: FnMut(&SignalingEvent) -> bool,
{
    while let Some(event) = events.recv().await {
        if pred(&event) {
            return Some(event);
        }
    }
    None
}
