//! Transfer management
//!
//! The [`TransferManager`] owns every [`TransferSession`], the sources of
//! outbound files and the send links of connected peers. It plugs into the
//! peer sessions as their [`PeerHandler`].
//!
//! # Transfer Flow
//!
//! ```text
//! Sender                               Receiver
//!     |                                    |
//!     |-- file {offer} ------------------->|  Waiting (decision pending)
//!     |<--------------------- file-accept -|  Accepted
//!     |-- chunk 0 / file-chunk 0 --------->|  Transferring
//!     |-- ...                              |
//!     |          [channel lost]            |  both sides: Paused
//!     |          [reconnected]             |
//!     |<-------- resend-request {missing} -|
//!     |-- missing chunks, any order ------>|
//!     |                                    |  assemble, verify digest
//!     |                                    |  Completed
//! ```
//!
//! Each accepting peer gets its own pump task, so streams to different
//! peers advance independently.

use super::session::{
    ChunkOutcome, Direction, PumpStep, StreamState, TransferSession, TransferState,
};
use super::source::{ChunkSource, digest_source};
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventSender, OfferDecision, TransferProgress};
use crate::peer::{ChunkHeader, PeerHandler, PeerLink};
use crate::protocol::{ControlMessage, FileId, FileOffer, new_file_id};
use async_trait::async_trait;
use dashmap::DashMap;
use peerdrop_discovery::PeerId;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::Instrument;

type SharedSession = Arc<Mutex<TransferSession>>;

/// Point-in-time summary of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    /// Transfer
    pub file_id: FileId,
    /// File name from the offer
    pub file_name: String,
    /// Send or receive
    pub direction: Direction,
    /// Current state
    pub state: TransferState,
    /// File size
    pub file_size: u64,
    /// Chunk count
    pub total_chunks: u64,
    /// Chunks received (receive side)
    pub received_chunks: u64,
    /// Sender (receive) or pending and accepting peers (send)
    pub peers: Vec<PeerId>,
    /// Paused by the user
    pub user_paused: bool,
}

impl TransferSnapshot {
    fn of(session: &TransferSession) -> Self {
        let peers = match session.direction() {
            Direction::Receive => vec![session.sender().clone()],
            Direction::Send => {
                let mut peers = session.pending_peers();
                peers.extend(session.stream_peers());
                peers.sort();
                peers
            }
        };
        Self {
            file_id: session.file_id().clone(),
            file_name: session.offer().file_name.clone(),
            direction: session.direction(),
            state: session.state(),
            file_size: session.offer().file_size,
            total_chunks: session.total_chunks(),
            received_chunks: session.received_count(),
            peers,
            user_paused: session.user_paused(),
        }
    }
}

/// Coordinates all transfers of one local peer.
///
/// Thread-safe; every method takes `&self`. Create with
/// [`TransferManager::new`], which returns an `Arc` because pump tasks hold
/// a weak reference back to the manager.
pub struct TransferManager {
    local: PeerId,
    config: TransferConfig,
    /// fileId -> session
    transfers: DashMap<FileId, SharedSession>,
    /// fileId -> source of an outbound transfer
    sources: DashMap<FileId, Arc<dyn ChunkSource>>,
    /// peer -> send link while connected
    links: DashMap<PeerId, PeerLink>,
    /// fileId -> when the transfer last reached a terminal state
    finished: DashMap<FileId, Instant>,
    events: EventSender,
    /// Serializes capacity checks with session creation
    admission: Mutex<()>,
    this: Weak<TransferManager>,
}

impl TransferManager {
    /// Create a manager for `local`
    #[must_use]
    pub fn new(local: PeerId, config: TransferConfig, events: EventSender) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            config,
            transfers: DashMap::new(),
            sources: DashMap::new(),
            links: DashMap::new(),
            finished: DashMap::new(),
            events,
            admission: Mutex::new(()),
            this: this.clone(),
        })
    }

    /// Transfer configuration
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Peers with a live send link
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Number of transfers not yet Completed, Failed or Cancelled
    pub async fn active_count(&self) -> usize {
        let mut active = 0;
        for (_, session) in self.sessions() {
            if !session.lock().await.state().is_terminal() {
                active += 1;
            }
        }
        active
    }

    /// Summary of one transfer
    pub async fn transfer(&self, file_id: &str) -> Option<TransferSnapshot> {
        let session = self.session(file_id)?;
        let snapshot = TransferSnapshot::of(&*session.lock().await);
        Some(snapshot)
    }

    /// Summaries of every tracked transfer
    pub async fn transfers(&self) -> Vec<TransferSnapshot> {
        let mut snapshots = Vec::new();
        for (_, session) in self.sessions() {
            snapshots.push(TransferSnapshot::of(&*session.lock().await));
        }
        snapshots.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        snapshots
    }

    /// State of one transfer
    pub async fn transfer_state(&self, file_id: &str) -> Option<TransferState> {
        let session = self.session(file_id)?;
        let state = session.lock().await.state();
        Some(state)
    }

    fn session(&self, file_id: &str) -> Option<SharedSession> {
        self.transfers
            .get(file_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn sessions(&self) -> Vec<(FileId, SharedSession)> {
        self.transfers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn link(&self, peer: &PeerId) -> Option<PeerLink> {
        self.links
            .get(peer)
            .map(|entry| entry.value().clone())
            .filter(|link| !link.is_closed())
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn send_to(&self, peer: &PeerId, message: &ControlMessage) -> bool {
        let Some(link) = self.link(peer) else {
            tracing::debug!(peer = %peer, kind = message.message_type(), "No link, message not sent");
            return false;
        };
        match link.send_control(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(peer = %peer, kind = message.message_type(), error = %e, "Message not sent");
                false
            }
        }
    }

    // ============ Send path ============

    /// Offer a file to every connected peer.
    ///
    /// Size and capacity are checked before anything is created, so a
    /// rejected call leaves no transfer behind.
    ///
    /// # Errors
    ///
    /// - `Error::CapacityExceeded` if the file is larger than
    ///   `max_file_size` or `max_concurrent_transfers` transfers are active
    /// - `Error::NoConnectedPeers` if no peer could be offered the file
    /// - `Error::Io` if the digest could not be computed
    pub async fn send_file(
        &self,
        source: Arc<dyn ChunkSource>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Result<FileId> {
        let file_size = source.len();
        if file_size > self.config.max_file_size {
            return Err(Error::capacity("file exceeds max_file_size"));
        }
        if self.active_count().await >= self.config.max_concurrent_transfers {
            return Err(Error::capacity("too many concurrent transfers"));
        }
        let recipients: Vec<PeerLink> = self
            .connected_peers()
            .iter()
            .filter_map(|peer| self.link(peer))
            .collect();
        if recipients.is_empty() {
            return Err(Error::NoConnectedPeers);
        }

        let chunk_size = self.config.chunk_size;
        let hash = if self.config.compute_digest {
            Some(digest_source(source.as_ref(), chunk_size).await?)
        } else {
            None
        };
        let offer = FileOffer {
            file_id: new_file_id(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            total_chunks: file_size.div_ceil(chunk_size as u64),
            chunk_size,
            hash,
            sender_id: self.local.clone(),
        };
        let file_id = offer.file_id.clone();

        {
            let _admission = self.admission.lock().await;
            if self.active_count().await >= self.config.max_concurrent_transfers {
                return Err(Error::capacity("too many concurrent transfers"));
            }
            let session = TransferSession::new_send(
                offer.clone(),
                recipients.iter().map(|link| link.peer().clone()),
                &self.config,
            );
            self.sources.insert(file_id.clone(), source);
            self.transfers
                .insert(file_id.clone(), Arc::new(Mutex::new(session)));
        }

        tracing::info!(
            file_id = %file_id,
            file_name = %offer.file_name,
            file_size,
            total_chunks = offer.total_chunks,
            recipients = recipients.len(),
            "Offering file"
        );

        let message = ControlMessage::File(offer);
        let mut delivered = 0usize;
        for link in &recipients {
            match link.send_control(&message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(file_id = %file_id, peer = %link.peer(), error = %e, "Offer not delivered");
                    if let Some(session) = self.session(&file_id) {
                        session.lock().await.remove_peer(link.peer());
                    }
                }
            }
        }

        if delivered == 0 {
            self.transfers.remove(&file_id);
            self.sources.remove(&file_id);
            return Err(Error::NoConnectedPeers);
        }
        Ok(file_id)
    }

    async fn handle_accept(&self, peer: &PeerId, file_id: &str) {
        let Some(session) = self.session(file_id) else {
            tracing::debug!(file_id, peer = %peer, "Accept for unknown transfer");
            return;
        };
        let accepted = {
            let mut session = session.lock().await;
            session.direction() == Direction::Send && session.on_accept(peer)
        };
        if !accepted {
            tracing::debug!(file_id, peer = %peer, "Ignoring accept without a pending offer");
            return;
        }
        tracing::info!(file_id, peer = %peer, "Offer accepted");
        self.ensure_pump(file_id, peer).await;
    }

    async fn handle_reject(&self, peer: &PeerId, file_id: &str) {
        let Some(session) = self.session(file_id) else {
            return;
        };
        let mut session = session.lock().await;
        if session.direction() != Direction::Send || !session.on_reject(peer) {
            tracing::debug!(file_id, peer = %peer, "Ignoring reject without a pending offer");
            return;
        }
        tracing::info!(file_id, peer = %peer, "Offer rejected");
        if let Some(state) = session.evaluate_completion() {
            self.report_settled(&session, state);
        }
    }

    async fn handle_resend_request(&self, peer: &PeerId, file_id: &str, missing: &[u64]) {
        let Some(session) = self.session(file_id) else {
            tracing::debug!(file_id, peer = %peer, "Resend request for unknown transfer");
            return;
        };
        let planned = {
            let mut session = session.lock().await;
            session.direction() == Direction::Send && session.request_resend(peer, missing)
        };
        if planned {
            tracing::info!(file_id, peer = %peer, chunks = missing.len(), "Resending requested chunks");
            self.ensure_pump(file_id, peer).await;
        } else {
            tracing::debug!(file_id, peer = %peer, "Resend request cannot be served");
        }
    }

    /// Start a pump for `peer`'s stream unless one is running.
    async fn ensure_pump(&self, file_id: &str, peer: &PeerId) {
        let Some(session) = self.session(file_id) else {
            return;
        };
        if !session.lock().await.claim_pump(peer) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            session.lock().await.release_pump(peer);
            return;
        };

        let span = tracing::debug_span!("pump", file_id = %file_id, peer = %peer.short());
        let (file_id, peer) = (file_id.to_owned(), peer.clone());
        tokio::spawn(
            async move { this.run_pump(session, file_id, peer).await }.instrument(span),
        );
    }

    async fn run_pump(self: Arc<Self>, session: SharedSession, file_id: FileId, peer: PeerId) {
        let source = self
            .sources
            .get(&file_id)
            .map(|entry| Arc::clone(entry.value()));
        let Some(source) = source else {
            tracing::warn!(file_id = %file_id, "No source for outbound transfer");
            session.lock().await.release_pump(&peer);
            return;
        };
        let total_chunks = session.lock().await.total_chunks();
        tracing::debug!("Pump started");

        loop {
            let step = session.lock().await.pump_step(&peer);
            match step {
                PumpStep::Stop => {
                    tracing::debug!("Pump stopped");
                    return;
                }
                PumpStep::Send { index, offset, len } => {
                    let Some(link) = self.link(&peer) else {
                        if self.interrupt(&session, &peer, Some(index), None).await {
                            continue;
                        }
                        return;
                    };
                    let data = match source.read_chunk(offset, len).await {
                        Ok(data) => data,
                        Err(error) => {
                            self.fail_outbound(&session, error).await;
                            return;
                        }
                    };
                    match link.send_chunk(&file_id, index, total_chunks, data).await {
                        Ok(()) => {
                            let progress = {
                                let mut session = session.lock().await;
                                session.mark_sent(&peer, len);
                                progress_event(&mut session, &peer, false)
                            };
                            if let Some(progress) = progress {
                                self.emit(Event::TransferProgress(progress));
                            }
                        }
                        Err(e) => {
                            tracing::debug!(index, error = %e, "Chunk send interrupted");
                            if !self.interrupt(&session, &peer, Some(index), Some(&link)).await {
                                return;
                            }
                        }
                    }
                }
                PumpStep::Drained => {
                    let link = self.link(&peer);
                    let flushed = match &link {
                        Some(link) => link.flush().await.is_ok(),
                        None => false,
                    };
                    if !flushed {
                        if self.interrupt(&session, &peer, None, link.as_ref()).await {
                            continue;
                        }
                        return;
                    }

                    let mut guard = session.lock().await;
                    if !guard.finish_stream(&peer) {
                        continue;
                    }
                    let done = guard
                        .stream(&peer)
                        .is_some_and(|stream| stream.state() == StreamState::Done);
                    if done {
                        tracing::info!("Stream finished");
                        if let Some(progress) = progress_event(&mut guard, &peer, true) {
                            self.emit(Event::TransferProgress(progress));
                        }
                        if let Some(state) = guard.evaluate_completion() {
                            self.report_settled(&guard, state);
                        }
                    }
                    return;
                }
            }
        }
    }

    /// A send failed or the link vanished. Requeues the chunk and decides
    /// whether the pump can carry on over a newer link.
    async fn interrupt(
        &self,
        session: &SharedSession,
        peer: &PeerId,
        index: Option<u64>,
        failed: Option<&PeerLink>,
    ) -> bool {
        let mut guard = session.lock().await;
        if let Some(index) = index {
            guard.requeue(peer, index);
        }

        let newer_link = self
            .link(peer)
            .is_some_and(|link| failed.is_none_or(|failed| !failed.same_link(&link)));
        let active = guard
            .stream(peer)
            .is_some_and(|stream| stream.state() == StreamState::Active);
        if newer_link && active {
            return true;
        }

        let before = guard.state();
        guard.pause_stream(peer);
        guard.release_pump(peer);
        if before != TransferState::Paused && guard.state() == TransferState::Paused {
            self.emit(Event::TransferPaused {
                file_id: guard.file_id().clone(),
            });
        }
        false
    }

    async fn fail_outbound(&self, session: &SharedSession, error: Error) {
        let mut guard = session.lock().await;
        let file_id = guard.file_id().clone();
        if guard.fail() {
            tracing::warn!(file_id = %file_id, error = %error, "Outbound transfer failed");
            self.sources.remove(&file_id);
            self.schedule_release(&file_id);
            self.emit(Event::TransferFailed { file_id, error });
        }
    }

    fn report_settled(&self, session: &TransferSession, state: TransferState) {
        let file_id = session.file_id().clone();
        match state {
            TransferState::Completed => {
                tracing::info!(file_id = %file_id, "Outbound transfer completed");
                self.schedule_release(&file_id);
                self.emit(Event::TransferCompleted {
                    file_id,
                    file_name: session.offer().file_name.clone(),
                    direction: session.direction(),
                    data: None,
                });
            }
            TransferState::Cancelled => {
                tracing::info!(file_id = %file_id, "No peer accepted, transfer cancelled");
                self.sources.remove(&file_id);
                self.schedule_release(&file_id);
                self.emit(Event::TransferCancelled { file_id });
            }
            _ => {}
        }
    }

    // ============ Receive path ============

    async fn handle_offer(&self, peer: &PeerId, mut offer: FileOffer) {
        if offer.sender_id != *peer {
            tracing::debug!(peer = %peer, claimed = %offer.sender_id, "Offer names another sender, using channel peer");
            offer.sender_id = peer.clone();
        }
        let file_id = offer.file_id.clone();
        let reject = ControlMessage::FileReject {
            file_id: file_id.clone(),
        };

        if self.transfers.contains_key(&file_id) {
            tracing::debug!(file_id = %file_id, peer = %peer, "Ignoring duplicate offer");
            return;
        }
        if let Err(e) = offer.validate() {
            tracing::warn!(file_id = %file_id, peer = %peer, error = %e, "Rejecting malformed offer");
            self.send_to(peer, &reject).await;
            return;
        }
        if offer.file_size > self.config.max_file_size {
            tracing::info!(file_id = %file_id, file_size = offer.file_size, "Rejecting offer above max_file_size");
            self.send_to(peer, &reject).await;
            return;
        }
        if offer.total_chunks > self.config.max_offer_chunks {
            tracing::warn!(
                file_id = %file_id,
                peer = %peer,
                chunk_size = offer.chunk_size,
                total_chunks = offer.total_chunks,
                "Rejecting offer above max_offer_chunks"
            );
            self.send_to(peer, &reject).await;
            return;
        }

        let admitted = {
            let _admission = self.admission.lock().await;
            if self.transfers.contains_key(&file_id) {
                return;
            }
            if self.active_count().await >= self.config.max_concurrent_transfers {
                false
            } else {
                let session = TransferSession::new_receive(offer.clone(), &self.config);
                self.transfers
                    .insert(file_id.clone(), Arc::new(Mutex::new(session)));
                true
            }
        };
        if !admitted {
            tracing::info!(file_id = %file_id, "Rejecting offer, too many concurrent transfers");
            self.send_to(peer, &reject).await;
            return;
        }

        tracing::info!(
            file_id = %file_id,
            peer = %peer,
            file_name = %offer.file_name,
            file_size = offer.file_size,
            total_chunks = offer.total_chunks,
            "File offered"
        );
        let (decision, answer) = OfferDecision::new();
        self.emit(Event::FileOffered { offer, decision });

        let this = self.this.clone();
        tokio::spawn(async move {
            let accepted = answer.await.unwrap_or(false);
            if let Some(manager) = this.upgrade() {
                manager.resolve_offer(&file_id, accepted).await;
            }
        });
    }

    /// Apply the application's decision. The transfer may have been
    /// cancelled or its sender may have left while the decision was pending.
    async fn resolve_offer(&self, file_id: &str, accepted: bool) {
        let Some(session) = self.session(file_id) else {
            return;
        };
        let mut guard = session.lock().await;
        if guard.state() != TransferState::Waiting {
            tracing::debug!(file_id, state = %guard.state(), "Offer no longer waiting for a decision");
            return;
        }
        let sender = guard.sender().clone();

        if !accepted {
            drop(guard);
            self.transfers.remove(file_id);
            tracing::info!(file_id, "Offer declined");
            self.send_to(
                &sender,
                &ControlMessage::FileReject {
                    file_id: file_id.to_owned(),
                },
            )
            .await;
            return;
        }

        guard.accept();
        let complete_now = guard.is_complete();
        drop(guard);
        tracing::info!(file_id, "Offer accepted");

        let sent = self
            .send_to(
                &sender,
                &ControlMessage::FileAccept {
                    file_id: file_id.to_owned(),
                },
            )
            .await;
        if !sent {
            tracing::debug!(file_id, "Sender not connected, accept goes out on reconnect");
        }
        if complete_now {
            self.complete_receive(&session).await;
        }
    }

    async fn handle_chunk(&self, peer: &PeerId, header: ChunkHeader, data: Vec<u8>) {
        let Some(session) = self.session(&header.file_id) else {
            tracing::debug!(file_id = %header.file_id, "Chunk for unknown transfer");
            return;
        };

        let (progress, complete) = {
            let mut guard = session.lock().await;
            if guard.direction() != Direction::Receive || guard.sender() != peer {
                tracing::debug!(file_id = %header.file_id, peer = %peer, "Chunk from unexpected peer");
                return;
            }
            if header.total_chunks != guard.total_chunks() {
                tracing::warn!(file_id = %header.file_id, "Chunk disagrees with offered chunk count");
                return;
            }
            match guard.store_chunk(header.chunk_index, data) {
                Ok(ChunkOutcome::Duplicate) => {
                    tracing::trace!(file_id = %header.file_id, index = header.chunk_index, "Duplicate chunk ignored");
                    return;
                }
                Ok(ChunkOutcome::Stored { complete }) => {
                    (progress_event(&mut guard, peer, complete), complete)
                }
                Err(e) => {
                    tracing::debug!(
                        file_id = %header.file_id,
                        index = header.chunk_index,
                        state = %guard.state(),
                        error = %e,
                        "Dropping chunk"
                    );
                    return;
                }
            }
        };

        if let Some(progress) = progress {
            self.emit(Event::TransferProgress(progress));
        }
        if complete {
            self.complete_receive(&session).await;
        }
    }

    async fn complete_receive(&self, session: &SharedSession) {
        let mut guard = session.lock().await;
        let file_id = guard.file_id().clone();
        let file_name = guard.offer().file_name.clone();
        let assembled = guard.assemble();
        drop(guard);
        self.schedule_release(&file_id);
        match assembled {
            Ok(data) => {
                tracing::info!(file_id = %file_id, bytes = data.len(), "Transfer completed");
                self.emit(Event::TransferCompleted {
                    file_id,
                    file_name,
                    direction: Direction::Receive,
                    data: Some(data),
                });
            }
            Err(error) => {
                tracing::warn!(file_id = %file_id, error = %error, "Transfer failed verification");
                self.emit(Event::TransferFailed { file_id, error });
            }
        }
    }

    async fn handle_remote_cancel(&self, peer: &PeerId, file_id: &str) {
        let Some(session) = self.session(file_id) else {
            return;
        };
        let mut guard = session.lock().await;
        match guard.direction() {
            Direction::Receive => {
                if guard.sender() != peer || !guard.cancel() {
                    return;
                }
                drop(guard);
                tracing::info!(file_id, peer = %peer, "Sender cancelled transfer");
                self.schedule_release(file_id);
                self.emit(Event::TransferCancelled {
                    file_id: file_id.to_owned(),
                });
            }
            Direction::Send => {
                tracing::info!(file_id, peer = %peer, "Receiver cancelled transfer");
                guard.remove_peer(peer);
                if let Some(state) = guard.evaluate_completion() {
                    self.report_settled(&guard, state);
                }
            }
        }
    }

    // ============ Link lifecycle ============

    async fn link_up(&self, link: PeerLink) {
        let peer = link.peer().clone();
        if let Some(previous) = self.links.insert(peer.clone(), link.clone()) {
            if !previous.same_link(&link) {
                previous.close();
            }
        }

        let mut offers = Vec::new();
        let mut accepts = Vec::new();
        let mut resend_requests = Vec::new();
        let mut pumps = Vec::new();
        let mut resumed = Vec::new();

        for (file_id, session) in self.sessions() {
            let mut guard = session.lock().await;
            match guard.direction() {
                Direction::Send => {
                    if guard.is_pending(&peer) && !guard.state().is_terminal() {
                        offers.push(guard.offer().clone());
                    }
                    let was_paused = guard.state() == TransferState::Paused;
                    if guard.resume_stream(&peer) {
                        pumps.push(file_id.clone());
                        if was_paused && guard.state() != TransferState::Paused {
                            resumed.push(file_id);
                        }
                    }
                }
                Direction::Receive if guard.sender() == &peer => match guard.state() {
                    TransferState::Accepted => accepts.push(file_id),
                    TransferState::Paused if !guard.user_paused() => {
                        guard.resume();
                        resend_requests.push((file_id.clone(), guard.missing_chunks()));
                        resumed.push(file_id);
                    }
                    _ => {}
                },
                Direction::Receive => {}
            }
        }

        tracing::debug!(
            peer = %peer,
            offers = offers.len(),
            resend_requests = resend_requests.len(),
            resumed_streams = pumps.len(),
            "Link up"
        );

        for offer in offers {
            self.send_to(&peer, &ControlMessage::File(offer)).await;
        }
        for file_id in accepts {
            self.send_to(&peer, &ControlMessage::FileAccept { file_id })
                .await;
        }
        for (file_id, missing) in resend_requests {
            tracing::info!(file_id = %file_id, peer = %peer, missing = missing.len(), "Requesting missing chunks");
            self.send_to(&peer, &ControlMessage::ResendRequest { file_id, missing })
                .await;
        }
        for file_id in resumed {
            self.emit(Event::TransferResumed { file_id });
        }
        for file_id in pumps {
            self.ensure_pump(&file_id, &peer).await;
        }
    }

    async fn link_down(&self, peer: &PeerId) {
        if let Some((_, link)) = self.links.remove(peer) {
            link.close();
        }

        let mut paused = Vec::new();
        for (file_id, session) in self.sessions() {
            let mut guard = session.lock().await;
            let before = guard.state();
            match guard.direction() {
                Direction::Send => {
                    guard.pause_stream(peer);
                }
                Direction::Receive if guard.sender() == peer => {
                    guard.suspend();
                }
                Direction::Receive => {}
            }
            if before != TransferState::Paused && guard.state() == TransferState::Paused {
                paused.push(file_id);
            }
        }

        if !paused.is_empty() {
            tracing::info!(peer = %peer, transfers = paused.len(), "Peer disconnected, transfers paused");
        }
        for file_id in paused {
            self.emit(Event::TransferPaused { file_id });
        }
    }

    /// `peer` left the room: receives from it fail, sends to it drop the
    /// peer and settle.
    pub async fn peer_departed(&self, peer: &PeerId) {
        if let Some((_, link)) = self.links.remove(peer) {
            link.close();
        }

        // Finished transfers nobody can ask about any more
        let mut orphaned = Vec::new();
        for (file_id, session) in self.sessions() {
            let mut guard = session.lock().await;
            match guard.direction() {
                Direction::Receive if guard.sender() == peer => {
                    if guard.fail() {
                        drop(guard);
                        tracing::info!(file_id = %file_id, peer = %peer, "Sender left, transfer failed");
                        self.emit(Event::TransferFailed {
                            file_id: file_id.clone(),
                            error: Error::channel_closed("sender left the room"),
                        });
                    }
                    orphaned.push(file_id);
                }
                Direction::Send
                    if guard.is_pending(peer) || guard.stream(peer).is_some() =>
                {
                    guard.remove_peer(peer);
                    if let Some(state) = guard.evaluate_completion() {
                        self.report_settled(&guard, state);
                    }
                    if guard.state().is_terminal()
                        && guard.stream_peers().is_empty()
                        && guard.pending_peers().is_empty()
                    {
                        orphaned.push(file_id);
                    }
                }
                _ => {}
            }
        }
        for file_id in orphaned {
            self.release(&file_id);
        }
    }

    // ============ Retention ============

    /// Drop a finished transfer once `finished_retention` has passed. A
    /// later terminal transition (after a retry) restarts the window.
    fn schedule_release(&self, file_id: &str) {
        self.finished.insert(file_id.to_owned(), Instant::now());
        let retention = self.config.finished_retention();
        let this = self.this.clone();
        let file_id = file_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            let expired = manager
                .finished
                .get(&file_id)
                .is_some_and(|since| since.elapsed() >= retention);
            let terminal = match manager.session(&file_id) {
                Some(session) => session.lock().await.state().is_terminal(),
                None => false,
            };
            if expired && terminal {
                manager.release(&file_id);
            }
        });
    }

    fn release(&self, file_id: &str) {
        self.finished.remove(file_id);
        self.sources.remove(file_id);
        if self.transfers.remove(file_id).is_some() {
            tracing::debug!(file_id, "Released finished transfer");
        }
    }

    // ============ User controls ============

    /// Pause a transfer. In-flight chunks finish; nothing new is sent or
    /// stored until [`resume_transfer`](Self::resume_transfer).
    ///
    /// # Errors
    ///
    /// `Error::TransferNotFound` or `Error::InvalidState` if finished.
    pub async fn pause_transfer(&self, file_id: &str) -> Result<()> {
        let session = self
            .session(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_owned()))?;
        let changed = {
            let mut guard = session.lock().await;
            if guard.state().is_terminal() {
                return Err(Error::invalid_state("transfer already finished"));
            }
            guard.pause()
        };
        tracing::info!(file_id, "Transfer paused");
        if changed {
            self.emit(Event::TransferPaused {
                file_id: file_id.to_owned(),
            });
        }
        Ok(())
    }

    /// Resume a paused transfer: send streams continue from their cursor, a
    /// receive asks the sender for its missing chunks.
    ///
    /// # Errors
    ///
    /// `Error::TransferNotFound` or `Error::InvalidState` if finished.
    pub async fn resume_transfer(&self, file_id: &str) -> Result<()> {
        let session = self
            .session(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_owned()))?;

        let mut pumps = Vec::new();
        let mut request = None;
        let changed = {
            let mut guard = session.lock().await;
            if guard.state().is_terminal() {
                return Err(Error::invalid_state("transfer already finished"));
            }
            let changed = guard.resume();
            match guard.direction() {
                Direction::Send => pumps = guard.stream_peers(),
                Direction::Receive => {
                    let sender = guard.sender().clone();
                    if self.link(&sender).is_some() {
                        if changed {
                            request = Some((sender, guard.missing_chunks()));
                        }
                    } else {
                        // Waits for the sender to reconnect.
                        guard.suspend();
                    }
                }
            }
            changed && guard.state() != TransferState::Paused
        };

        tracing::info!(file_id, "Transfer resumed");
        if let Some((sender, missing)) = request {
            self.send_to(
                &sender,
                &ControlMessage::ResendRequest {
                    file_id: file_id.to_owned(),
                    missing,
                },
            )
            .await;
        }
        for peer in pumps {
            self.ensure_pump(file_id, &peer).await;
        }
        if changed {
            self.emit(Event::TransferResumed {
                file_id: file_id.to_owned(),
            });
        }
        Ok(())
    }

    /// Cancel a transfer and tell the other side.
    ///
    /// # Errors
    ///
    /// `Error::TransferNotFound` or `Error::InvalidState` if finished.
    pub async fn cancel_transfer(&self, file_id: &str) -> Result<()> {
        let session = self
            .session(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_owned()))?;
        let counterparts = {
            let mut guard = session.lock().await;
            let counterparts = match guard.direction() {
                Direction::Receive => vec![guard.sender().clone()],
                Direction::Send => {
                    let mut peers = guard.pending_peers();
                    peers.extend(guard.stream_peers());
                    peers
                }
            };
            if !guard.cancel() {
                return Err(Error::invalid_state("transfer already finished"));
            }
            counterparts
        };
        self.sources.remove(file_id);
        self.schedule_release(file_id);

        tracing::info!(file_id, peers = counterparts.len(), "Transfer cancelled");
        let message = ControlMessage::FileCancel {
            file_id: file_id.to_owned(),
        };
        for peer in &counterparts {
            self.send_to(peer, &message).await;
        }
        self.emit(Event::TransferCancelled {
            file_id: file_id.to_owned(),
        });
        Ok(())
    }

    /// Retry a receive that failed verification: clear its chunks and ask
    /// the sender for all of them again.
    ///
    /// # Errors
    ///
    /// `Error::TransferNotFound`, or `Error::InvalidState` unless the
    /// transfer is a failed receive.
    pub async fn retry_transfer(&self, file_id: &str) -> Result<()> {
        let session = self
            .session(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_owned()))?;
        let (sender, missing) = {
            let mut guard = session.lock().await;
            guard.reset_for_retry()?;
            (guard.sender().clone(), guard.missing_chunks())
        };

        tracing::info!(file_id, chunks = missing.len(), "Retrying transfer");
        let requested = self
            .send_to(
                &sender,
                &ControlMessage::ResendRequest {
                    file_id: file_id.to_owned(),
                    missing,
                },
            )
            .await;
        if !requested {
            session.lock().await.suspend();
        }
        self.emit(Event::TransferResumed {
            file_id: file_id.to_owned(),
        });
        Ok(())
    }
}

fn progress_event(
    session: &mut TransferSession,
    peer: &PeerId,
    force: bool,
) -> Option<TransferProgress> {
    let sample = session.progress_sample(peer, force)?;
    Some(TransferProgress {
        file_id: session.file_id().clone(),
        peer: peer.clone(),
        direction: session.direction(),
        state: session.state(),
        bytes: session.bytes_done(peer),
        total: session.offer().file_size,
        percent: sample.percent,
        bytes_per_sec: sample.bytes_per_sec,
        eta: sample.eta,
    })
}

#[async_trait]
impl PeerHandler for TransferManager {
    async fn on_connected(&self, link: PeerLink) {
        self.link_up(link).await;
    }

    async fn on_disconnected(&self, peer: &PeerId) {
        self.link_down(peer).await;
    }

    async fn on_message(&self, peer: &PeerId, message: ControlMessage) {
        match message {
            ControlMessage::File(offer) => self.handle_offer(peer, offer).await,
            ControlMessage::FileAccept { file_id } => self.handle_accept(peer, &file_id).await,
            ControlMessage::FileReject { file_id } => self.handle_reject(peer, &file_id).await,
            ControlMessage::FileCancel { file_id } => {
                self.handle_remote_cancel(peer, &file_id).await;
            }
            ControlMessage::ResendRequest { file_id, missing } => {
                self.handle_resend_request(peer, &file_id, &missing).await;
            }
            other => {
                tracing::debug!(peer = %peer, kind = other.message_type(), "Ignoring message");
            }
        }
    }

    async fn on_chunk(&self, peer: &PeerId, header: ChunkHeader, data: Vec<u8>) {
        self.handle_chunk(peer, header, data).await;
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("local", &self.local)
            .field("transfers", &self.transfers.len())
            .field("links", &self.links.len())
            .finish()
    }
}
