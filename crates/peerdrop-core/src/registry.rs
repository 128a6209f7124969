//! Session registry - the entry point of a peerdrop node
//!
//! The registry owns the room roster, one [`PeerSessionHandle`] per remote
//! peer and the [`TransferManager`]. A router task consumes the signaling
//! event stream and keeps the sessions in line with the roster:
//!
//! ```text
//!  SignalingEvents ──► router ──► roster ──► PeerSession (one per peer)
//!                        │                        │
//!                        └── envelopes ──► signal │ channel
//!                                                 ▼
//!                                          TransferManager
//! ```
//!
//! # Example
//!
//! ```no_run
//! use peerdrop_core::{Config, SessionRegistry};
//! use peerdrop_discovery::relay::{RelayClient, RelayHub};
//! use peerdrop_transport::MemoryNetwork;
//! use std::sync::Arc;
//!
//! # async fn example() -> peerdrop_core::Result<()> {
//! let hub = RelayHub::new();
//! let network = MemoryNetwork::new();
//! let (client, signaling_events) = RelayClient::connect(&hub, "alice").await?;
//! let factory = network.factory(peerdrop_discovery::SignalingClient::local_id(&client).clone());
//!
//! let (registry, mut events) =
//!     SessionRegistry::new(Config::default(), Arc::new(client), Arc::new(factory))?;
//! registry.start(signaling_events).await;
//! registry.join_room("lobby").await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventStream, event_channel};
use crate::peer::{PeerHandler, PeerSessionHandle, PeerState, SessionContext};
use crate::protocol::{ControlMessage, FileId};
use crate::roster::Roster;
use crate::transfer::{ChunkSource, FileSource, TransferManager, TransferSnapshot, TransferState};
use dashmap::DashMap;
use peerdrop_discovery::{Member, PeerId, SignalingClient, SignalingEvent, SignalingEvents};
use peerdrop_transport::{ChannelFactory, Signal};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// MIME type announced for files offered from disk
const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

struct RegistryInner {
    local: PeerId,
    config: Config,
    signaling: Arc<dyn SignalingClient>,
    roster: Roster,
    /// peer -> session task
    sessions: DashMap<PeerId, PeerSessionHandle>,
    transfers: Arc<TransferManager>,
    context: SessionContext,
    router: Mutex<Option<JoinHandle<()>>>,
}

/// Maps peer ids to sessions and exposes the node's operations.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Build a registry around a signaling client and a channel factory.
    ///
    /// Returns the registry and the application event stream. Nothing
    /// happens until [`start`](Self::start) is given the signaling events.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` fails validation.
    pub fn new(
        config: Config,
        signaling: Arc<dyn SignalingClient>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<(Self, EventStream)> {
        config.validate()?;
        let (events, stream) = event_channel();
        let local = signaling.local_id().clone();
        let transfers = TransferManager::new(local.clone(), config.transfer.clone(), events.clone());
        let roster = Roster::new();

        let handler: Arc<dyn PeerHandler> = transfers.clone();
        let context = SessionContext {
            local: local.clone(),
            config: config.peer.clone(),
            high_water: config.transfer.backpressure_high_water_bytes,
            signaling: Arc::clone(&signaling),
            factory,
            roster: roster.clone(),
            handler,
            events,
        };

        let registry = Self {
            inner: Arc::new(RegistryInner {
                local,
                config,
                signaling,
                roster,
                sessions: DashMap::new(),
                transfers,
                context,
                router: Mutex::new(None),
            }),
        };
        Ok((registry, stream))
    }

    /// Start routing signaling events. Replaces a router started earlier.
    pub async fn start(&self, signaling_events: SignalingEvents) {
        let registry = self.clone();
        let span = tracing::info_span!("registry", local = %self.inner.local.short());
        let task = tokio::spawn(registry.route(signaling_events).instrument(span));
        if let Some(previous) = self.inner.router.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Join (or switch to) a room.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signaling` if the relay refuses.
    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        tracing::info!(room = room_id, "Joining room");
        self.inner.signaling.join_room(room_id).await?;
        Ok(())
    }

    /// Local peer id
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Room members other than the local peer
    pub async fn roster(&self) -> Vec<Member> {
        let mut members = self.inner.roster.members().await;
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// The transfer manager
    #[must_use]
    pub fn transfer_manager(&self) -> &Arc<TransferManager> {
        &self.inner.transfers
    }

    // ============ Peer sessions ============

    /// State of the session to `peer`
    #[must_use]
    pub fn peer_state(&self, peer: &PeerId) -> Option<PeerState> {
        self.inner.sessions.get(peer).map(|handle| handle.state())
    }

    /// Every session and its state, sorted by peer id
    #[must_use]
    pub fn peers(&self) -> Vec<(PeerId, PeerState)> {
        let mut peers: Vec<(PeerId, PeerState)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// Peers whose session is `Connected`
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers()
            .into_iter()
            .filter(|(_, state)| *state == PeerState::Connected)
            .map(|(peer, _)| peer)
            .collect()
    }

    /// Wait until `peer`'s session satisfies `predicate`, up to `timeout`.
    ///
    /// Returns `None` on timeout or if no session exists.
    pub async fn wait_for_peer_state<F>(
        &self,
        peer: &PeerId,
        timeout: Duration,
        mut predicate: F,
    ) -> Option<PeerState>
    where
        F: FnMut(PeerState) -> bool,
    {
        let mut status = self
            .inner
            .sessions
            .get(peer)
            .map(|handle| handle.subscribe())?;
        match tokio::time::timeout(timeout, status.wait_for(|s| predicate(s.state))).await {
            Ok(Ok(snapshot)) => Some(snapshot.state),
            _ => None,
        }
    }

    /// Manually retry a `Failed` or `Disconnected` session.
    ///
    /// # Errors
    ///
    /// Returns `Error::PeerNotFound` if the peer is not in the room.
    pub async fn retry_peer(&self, peer: &PeerId) -> Result<()> {
        if !self.inner.roster.contains(peer).await {
            return Err(Error::PeerNotFound(peer.clone()));
        }
        let delivered = self
            .inner
            .sessions
            .get(peer)
            .is_some_and(|handle| !handle.is_finished() && handle.retry());
        if !delivered {
            self.ensure_session(peer);
        }
        tracing::info!(peer = %peer, "Manual retry");
        Ok(())
    }

    /// Retry every room member whose session is not `Connected`. Returns the
    /// number of sessions retried.
    pub async fn reconnect_all(&self) -> usize {
        let mut retried = 0;
        for peer in self.inner.roster.ids().await {
            let state = self.peer_state(&peer);
            if state == Some(PeerState::Connected) {
                continue;
            }
            if self.retry_peer(&peer).await.is_ok() {
                retried += 1;
            }
        }
        tracing::info!(retried, "Reconnecting all peers");
        retried
    }

    /// Send a chat message to every connected peer. Returns how many peers
    /// it reached.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoConnectedPeers` if nobody received it.
    pub async fn broadcast_text(&self, text: &str) -> Result<usize> {
        let links: Vec<_> = self
            .inner
            .sessions
            .iter()
            .filter_map(|entry| entry.value().link())
            .collect();
        let message = ControlMessage::Text {
            text: text.to_owned(),
        };

        let mut delivered = 0;
        for link in links {
            match link.send_control(&message).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(peer = %link.peer(), error = %e, "Text not delivered"),
            }
        }
        if delivered == 0 {
            return Err(Error::NoConnectedPeers);
        }
        Ok(delivered)
    }

    // ============ Transfers ============

    /// Offer a file to every connected peer.
    ///
    /// # Errors
    ///
    /// See [`TransferManager::send_file`].
    pub async fn send_file(
        &self,
        source: Arc<dyn ChunkSource>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Result<FileId> {
        self.inner
            .transfers
            .send_file(source, file_name, file_type)
            .await
    }

    /// Offer a file from disk to every connected peer.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the file cannot be opened, otherwise as
    /// [`send_file`](Self::send_file).
    pub async fn send_path(&self, path: impl AsRef<Path>) -> Result<FileId> {
        let source = FileSource::open(path).await?;
        let file_name = source.file_name();
        self.send_file(Arc::new(source), file_name, DEFAULT_FILE_TYPE)
            .await
    }

    /// Pause a transfer.
    ///
    /// # Errors
    ///
    /// See [`TransferManager::pause_transfer`].
    pub async fn pause_transfer(&self, file_id: &str) -> Result<()> {
        self.inner.transfers.pause_transfer(file_id).await
    }

    /// Resume a transfer.
    ///
    /// # Errors
    ///
    /// See [`TransferManager::resume_transfer`].
    pub async fn resume_transfer(&self, file_id: &str) -> Result<()> {
        self.inner.transfers.resume_transfer(file_id).await
    }

    /// Cancel a transfer.
    ///
    /// # Errors
    ///
    /// See [`TransferManager::cancel_transfer`].
    pub async fn cancel_transfer(&self, file_id: &str) -> Result<()> {
        self.inner.transfers.cancel_transfer(file_id).await
    }

    /// Retry a receive that failed verification.
    ///
    /// # Errors
    ///
    /// See [`TransferManager::retry_transfer`].
    pub async fn retry_transfer(&self, file_id: &str) -> Result<()> {
        self.inner.transfers.retry_transfer(file_id).await
    }

    /// Summaries of every tracked transfer
    pub async fn transfers(&self) -> Vec<TransferSnapshot> {
        self.inner.transfers.transfers().await
    }

    /// State of one transfer
    pub async fn transfer_state(&self, file_id: &str) -> Option<TransferState> {
        self.inner.transfers.transfer_state(file_id).await
    }

    /// Stop routing and shut every session down.
    pub async fn shutdown(&self) {
        if let Some(router) = self.inner.router.lock().await.take() {
            router.abort();
        }
        let peers: Vec<PeerId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for peer in peers {
            if let Some((_, handle)) = self.inner.sessions.remove(&peer) {
                handle.shutdown();
            }
        }
        tracing::info!("Registry shut down");
    }

    // ============ Routing ============

    async fn route(self, mut signaling_events: SignalingEvents) {
        tracing::debug!("Router started");
        while let Some(event) = signaling_events.recv().await {
            self.handle_signaling_event(event).await;
        }
        tracing::debug!("Signaling stream ended");
    }

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::RoomJoined { room_id, members } => {
                tracing::info!(room = %room_id, members = members.len(), "Joined room");
                self.apply_roster(members).await;
            }
            SignalingEvent::RosterUpdated { members } => {
                self.apply_roster(members).await;
            }
            SignalingEvent::PeerJoined(member) => {
                if member.id == self.inner.local {
                    return;
                }
                let peer = member.id.clone();
                if self.inner.roster.insert(member).await {
                    tracing::info!(peer = %peer, "Peer joined");
                }
                self.ensure_session(&peer);
            }
            SignalingEvent::PeerLeft { id } => {
                self.inner.roster.remove(&id).await;
                self.depart(&id).await;
            }
            SignalingEvent::Envelope { from, payload } => {
                self.route_envelope(from, payload).await;
            }
        }
    }

    async fn apply_roster(&self, members: Vec<Member>) {
        let removed = self.inner.roster.replace(members, &self.inner.local).await;
        for peer in removed {
            self.depart(&peer).await;
        }
        for peer in self.inner.roster.ids().await {
            self.ensure_session(&peer);
        }
    }

    async fn route_envelope(&self, from: PeerId, payload: serde_json::Value) {
        let Some(signal) = Signal::from_value(&payload) else {
            tracing::debug!(peer = %from, "Ignoring envelope that is not a negotiation signal");
            return;
        };
        if !self.inner.roster.contains(&from).await {
            tracing::debug!(peer = %from, kind = signal.kind(), "Ignoring signal from peer outside the roster");
            return;
        }
        self.ensure_session(&from);
        let delivered = self
            .inner
            .sessions
            .get(&from)
            .is_some_and(|handle| handle.deliver_signal(signal));
        if !delivered {
            tracing::debug!(peer = %from, "Session gone before signal delivery");
        }
    }

    /// Spawn a session for `peer` unless a live one exists. A finished or
    /// `Gone` session is replaced.
    fn ensure_session(&self, peer: &PeerId) {
        if *peer == self.inner.local {
            return;
        }
        let stale = match self.inner.sessions.get(peer) {
            Some(handle) => handle.is_finished() || handle.state().is_terminal(),
            None => true,
        };
        if !stale {
            return;
        }
        tracing::debug!(peer = %peer, "Starting session");
        let handle = PeerSessionHandle::spawn(self.inner.context.clone(), peer.clone());
        if let Some(previous) = self.inner.sessions.insert(peer.clone(), handle) {
            previous.shutdown();
        }
    }

    async fn depart(&self, peer: &PeerId) {
        if let Some((_, handle)) = self.inner.sessions.remove(peer) {
            tracing::info!(peer = %peer, "Peer left, retiring session");
            handle.retire();
        }
        self.inner.transfers.peer_departed(peer).await;
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("local", &self.inner.local)
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}
