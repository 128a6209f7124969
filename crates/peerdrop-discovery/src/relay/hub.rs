//! In-memory relay hub for forwarding signaling between room members.
//!
//! The hub keeps one outbound queue per connected client and a room table.
//! Room semantics:
//! - joining a room leaves the previous one
//! - the joiner receives `room-joined` with the full roster
//! - every other member receives `user-connected`, then everyone receives
//!   `room-users-updated`
//! - disconnecting emits `user-disconnected` and `room-users-updated`
//! - `relay{to}` is delivered as `signal{from}` only if `to` is connected

use super::protocol::RelayMessage;
use crate::signaling::{SignalingError, SignalingResult};
use crate::{Member, PeerId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Connected client slot
#[derive(Debug)]
struct ClientSlot {
    /// User-chosen display name
    user_id: String,
    /// Room currently joined
    room: Option<String>,
    /// Outbound queue to the client
    tx: mpsc::UnboundedSender<RelayMessage>,
}

#[derive(Debug, Default)]
struct HubState {
    clients: HashMap<PeerId, ClientSlot>,
    rooms: HashMap<String, BTreeSet<PeerId>>,
}

impl HubState {
    fn roster(&self, room: &str) -> Vec<Member> {
        self.rooms
            .get(room)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        self.clients
                            .get(id)
                            .map(|slot| Member::new(id.clone(), slot.user_id.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn deliver(&self, to: &PeerId, msg: RelayMessage) {
        if let Some(slot) = self.clients.get(to) {
            // A closed receiver means the client is going away; its
            // disconnect will clean up the slot.
            let _ = slot.tx.send(msg);
        }
    }

    fn broadcast(&self, room: &str, msg: &RelayMessage, except: Option<&PeerId>) {
        if let Some(ids) = self.rooms.get(room) {
            for id in ids {
                if Some(id) != except {
                    self.deliver(id, msg.clone());
                }
            }
        }
    }

    /// Remove `id` from its room, notifying the remaining members.
    fn leave_room(&mut self, id: &PeerId) {
        let Some(room) = self.clients.get_mut(id).and_then(|slot| slot.room.take()) else {
            return;
        };

        let now_empty = match self.rooms.get_mut(&room) {
            Some(ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => true,
        };

        if now_empty {
            self.rooms.remove(&room);
            return;
        }

        self.broadcast(&room, &RelayMessage::UserDisconnected { id: id.clone() }, None);
        let members = self.roster(&room);
        self.broadcast(&room, &RelayMessage::RoomUsersUpdated { members }, None);
    }
}

/// In-memory rendezvous relay.
///
/// Cloning a hub yields another handle to the same rooms.
#[derive(Debug, Clone, Default)]
pub struct RelayHub {
    state: Arc<RwLock<HubState>>,
}

impl RelayHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under a fresh random id.
    pub async fn attach(
        &self,
        user_id: impl Into<String>,
    ) -> (PeerId, mpsc::UnboundedReceiver<RelayMessage>) {
        let id = PeerId::random();
        let rx = self.attach_as(id.clone(), user_id).await;
        (id, rx)
    }

    /// Register a client under a caller-chosen id, replacing any previous
    /// client with the same id.
    pub async fn attach_as(
        &self,
        id: PeerId,
        user_id: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<RelayMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        if state.clients.contains_key(&id) {
            state.leave_room(&id);
        }
        state.clients.insert(
            id.clone(),
            ClientSlot {
                user_id: user_id.into(),
                room: None,
                tx,
            },
        );
        tracing::debug!(peer = %id, "Relay client attached");
        rx
    }

    /// Process a message sent by client `from`.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::NotConnected` if `from` is not attached and
    /// `SignalingError::PeerNotFound` when relaying to an unknown peer.
    pub async fn handle(&self, from: &PeerId, msg: RelayMessage) -> SignalingResult<()> {
        let mut state = self.state.write().await;
        if !state.clients.contains_key(from) {
            return Err(SignalingError::NotConnected);
        }

        match msg {
            RelayMessage::JoinRoom { room_id } => {
                state.leave_room(from);

                let user_id = match state.clients.get_mut(from) {
                    Some(slot) => {
                        slot.room = Some(room_id.clone());
                        slot.user_id.clone()
                    }
                    None => return Err(SignalingError::NotConnected),
                };
                state
                    .rooms
                    .entry(room_id.clone())
                    .or_default()
                    .insert(from.clone());

                let members = state.roster(&room_id);
                state.deliver(
                    from,
                    RelayMessage::RoomJoined {
                        room_id: room_id.clone(),
                        members: members.clone(),
                    },
                );
                state.broadcast(
                    &room_id,
                    &RelayMessage::UserConnected(Member::new(from.clone(), user_id)),
                    Some(from),
                );
                state.broadcast(&room_id, &RelayMessage::RoomUsersUpdated { members }, None);

                tracing::debug!(peer = %from, room = %room_id, "Joined room");
                Ok(())
            }
            RelayMessage::Relay { to, signal } => {
                if !state.clients.contains_key(&to) {
                    tracing::debug!(from = %from, to = %to, "Relay destination not connected");
                    return Err(SignalingError::PeerNotFound(to));
                }
                state.deliver(
                    &to,
                    RelayMessage::Signal {
                        from: from.clone(),
                        signal,
                    },
                );
                Ok(())
            }
            other => {
                tracing::warn!(
                    peer = %from,
                    msg_type = other.message_type(),
                    "Relay ignoring server-only message from client"
                );
                Err(SignalingError::Relay(format!(
                    "unexpected message type: {}",
                    other.message_type()
                )))
            }
        }
    }

    /// Detach a client, removing it from its room.
    pub async fn detach(&self, id: &PeerId) {
        let mut state = self.state.write().await;
        state.leave_room(id);
        if state.clients.remove(id).is_some() {
            tracing::debug!(peer = %id, "Relay client detached");
        }
    }

    /// Current roster of a room.
    pub async fn room_members(&self, room_id: &str) -> Vec<Member> {
        self.state.read().await.roster(room_id)
    }

    /// Number of attached clients.
    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }
}
