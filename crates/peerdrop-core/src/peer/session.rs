//! Per-peer session actor.
//!
//! Each session is a single task selecting over its command inbox, the
//! current channel's event stream, and four optional deadlines:
//!
//! | Timer | Armed | On expiry |
//! |-------|-------|-----------|
//! | connect | attempt started, until `Connected` | retry path |
//! | probe | channel open, until probe answered | retry path |
//! | keepalive | while `Connected` | send keepalive, count misses |
//! | retry | after a failure, within the attempt budget | re-check roster, reconnect |
//!
//! Every retry discards the old channel and negotiates a brand new one.

use super::{
    Backoff, ChunkHeader, KeepaliveMonitor, KeepaliveVerdict, PeerHandler, PeerLink, PeerState,
};
use crate::config::PeerConfig;
use crate::error::Error;
use crate::events::{Event, EventSender};
use crate::protocol::{ControlMessage, WireMessage};
use crate::roster::Roster;
use peerdrop_crypto::{KeyAgreement, PublicKey};
use peerdrop_discovery::{PeerId, SignalingClient};
use peerdrop_transport::{
    Channel, ChannelEvent, ChannelEvents, ChannelFactory, ChannelHandle, Frame, Signal,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Local peer id
    pub local: PeerId,
    /// Session configuration
    pub config: PeerConfig,
    /// Backpressure threshold for links
    pub high_water: usize,
    /// Rendezvous client used to forward negotiation signals
    pub signaling: Arc<dyn SignalingClient>,
    /// Channel negotiation primitive
    pub factory: Arc<dyn ChannelFactory>,
    /// Current room membership
    pub roster: Roster,
    /// Receiver of decoded traffic and lifecycle changes
    pub handler: Arc<dyn PeerHandler>,
    /// Application event stream
    pub events: EventSender,
}

#[derive(Debug)]
enum Command {
    Signal(Signal),
    Retry,
    RosterLeft,
    Shutdown,
}

/// Externally visible session status
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Connection state
    pub state: PeerState,
    /// Automatic reconnect attempts since the last success or manual retry
    pub retry_count: u32,
    /// Send handle, present while `Connected`
    pub link: Option<PeerLink>,
    /// Last inbound traffic
    pub last_activity: Instant,
}

/// Handle to a running peer session task.
///
/// Dropping the handle shuts the session down.
pub struct PeerSessionHandle {
    peer: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl PeerSessionHandle {
    /// Start a session for `peer`. It immediately begins connecting.
    #[must_use]
    pub fn spawn(ctx: SessionContext, peer: PeerId) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SessionSnapshot {
            state: PeerState::Idle,
            retry_count: 0,
            link: None,
            last_activity: Instant::now(),
        });

        let session = PeerSession {
            backoff: Backoff::from_config(&ctx.config),
            peer: peer.clone(),
            ctx,
            status,
            state: PeerState::Idle,
            retry_count: 0,
            attempt: None,
            retry_at: None,
            last_activity: Instant::now(),
        };
        let span = tracing::info_span!("peer_session", peer = %peer.short());
        let task = tokio::spawn(session.run(inbox).instrument(span));

        Self {
            peer,
            commands,
            status: status_rx,
            task,
        }
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.status.borrow().state
    }

    /// Current retry count
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.status.borrow().retry_count
    }

    /// Full status snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    /// Send handle while `Connected`
    #[must_use]
    pub fn link(&self) -> Option<PeerLink> {
        self.status.borrow().link.clone()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.clone()
    }

    /// Whether the session task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Deliver a negotiation signal from the remote peer.
    pub fn deliver_signal(&self, signal: Signal) -> bool {
        self.commands.send(Command::Signal(signal)).is_ok()
    }

    /// Manual retry: reset the retry budget and reconnect now.
    pub fn retry(&self) -> bool {
        self.commands.send(Command::Retry).is_ok()
    }

    /// The peer left the roster: tear down and go `Gone`.
    pub fn retire(&self) {
        let _ = self.commands.send(Command::RosterLeft);
    }

    /// Stop the session without changing roster semantics.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Wait until the state satisfies `predicate`, up to `timeout`.
    pub async fn wait_for_state<F>(&self, timeout: Duration, mut predicate: F) -> Option<PeerState>
    where
        F: FnMut(PeerState) -> bool,
    {
        let mut rx = self.status.clone();
        let state = match tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s.state))).await
        {
            Ok(Ok(snapshot)) => Some(snapshot.state),
            _ => None,
        };
        state
    }
}

impl std::fmt::Debug for PeerSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSessionHandle")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// One negotiation attempt and, once open, the channel it produced.
struct Attempt {
    channel: Arc<dyn Channel>,
    events: ChannelEvents,
    link: PeerLink,
    local_offer: bool,
    opened: bool,
    pending_ice_like: Vec<Signal>,
    key_agreement: Option<KeyAgreement>,
    connect_deadline: Instant,
    probe_deadline: Option<Instant>,
    probe_nonce: Option<u64>,
    keepalive: KeepaliveMonitor,
    next_keepalive: Option<Instant>,
    pending_chunk: Option<ChunkHeader>,
    /// Application traffic received before the probe completed
    early_inbound: Vec<Inbound>,
}

/// Application traffic bound for the handler or the event stream
enum Inbound {
    Message(ControlMessage),
    Chunk(ChunkHeader, Vec<u8>),
}

/// Inbound items held per attempt until it is Connected
const MAX_EARLY_INBOUND: usize = 256;

#[derive(Clone, Copy)]
struct Timers {
    connect: Option<Instant>,
    probe: Option<Instant>,
    keepalive: Option<Instant>,
    retry: Option<Instant>,
}

struct PeerSession {
    peer: PeerId,
    ctx: SessionContext,
    backoff: Backoff,
    status: watch::Sender<SessionSnapshot>,
    state: PeerState,
    retry_count: u32,
    attempt: Option<Attempt>,
    retry_at: Option<Instant>,
    last_activity: Instant,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(attempt: &mut Option<Attempt>) -> Option<ChannelEvent> {
    match attempt {
        Some(attempt) => attempt.events.recv().await,
        None => std::future::pending().await,
    }
}

impl PeerSession {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        self.connect().await;

        while !self.state.is_terminal() {
            let timers = self.timers();
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.discard_attempt().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                event = next_event(&mut self.attempt) => self.handle_channel_event(event).await,
                () = sleep_until(timers.connect) => {
                    self.fail_attempt(Error::negotiation_timeout("not connected within connection timeout")).await;
                }
                () = sleep_until(timers.probe) => {
                    self.fail_attempt(Error::negotiation_timeout("liveness probe unanswered")).await;
                }
                () = sleep_until(timers.keepalive) => self.keepalive_tick().await,
                () = sleep_until(timers.retry) => self.retry_due().await,
            }
        }

        tracing::debug!(peer = %self.peer, state = %self.state, "Session task finished");
    }

    fn timers(&self) -> Timers {
        let attempt = self.attempt.as_ref();
        let negotiating = self.state != PeerState::Connected;
        Timers {
            connect: attempt
                .filter(|_| negotiating)
                .map(|attempt| attempt.connect_deadline),
            probe: attempt.and_then(|attempt| attempt.probe_deadline),
            keepalive: attempt.and_then(|attempt| attempt.next_keepalive),
            retry: self.retry_at,
        }
    }

    fn publish(&self) {
        let link = if self.state == PeerState::Connected {
            self.attempt.as_ref().map(|attempt| attempt.link.clone())
        } else {
            None
        };
        self.status.send_replace(SessionSnapshot {
            state: self.state,
            retry_count: self.retry_count,
            link,
            last_activity: self.last_activity,
        });
    }

    fn set_state(&mut self, state: PeerState) {
        if self.state == state {
            self.publish();
            return;
        }
        tracing::debug!(peer = %self.peer, from = %self.state, to = %state, "Peer state transition");
        self.state = state;
        self.publish();
        let _ = self.ctx.events.send(Event::PeerStateChanged {
            peer: self.peer.clone(),
            state,
        });
    }

    // ============ Connection lifecycle ============

    async fn connect(&mut self) {
        self.retry_at = None;
        if !self.ctx.roster.contains(&self.peer).await {
            tracing::info!(peer = %self.peer, "Peer not in roster, not connecting");
            self.depart().await;
            return;
        }

        match self.ctx.factory.open(&self.peer).await {
            Ok(handle) => {
                tracing::debug!(
                    peer = %self.peer,
                    negotiation_id = handle.channel.negotiation_id(),
                    attempt = self.retry_count,
                    "Opening channel"
                );
                self.install_attempt(handle, true);
                self.set_state(PeerState::Connecting);
            }
            Err(e) => self.fail_attempt(e.into()).await,
        }
    }

    fn install_attempt(&mut self, handle: ChannelHandle, local_offer: bool) {
        let link = PeerLink::new(
            self.peer.clone(),
            Arc::clone(&handle.channel),
            self.ctx.high_water,
        );
        self.attempt = Some(Attempt {
            channel: handle.channel,
            events: handle.events,
            link,
            local_offer,
            opened: false,
            pending_ice_like: Vec::new(),
            key_agreement: None,
            connect_deadline: Instant::now() + self.ctx.config.connection_timeout(),
            probe_deadline: None,
            probe_nonce: None,
            keepalive: KeepaliveMonitor::new(self.ctx.config.max_missed_keepalive),
            next_keepalive: None,
            pending_chunk: None,
            early_inbound: Vec::new(),
        });
    }

    /// Close the current channel, notifying the handler if it was live.
    async fn discard_attempt(&mut self) {
        let was_connected = self.state == PeerState::Connected;
        if let Some(attempt) = self.attempt.take() {
            attempt.link.close();
            attempt.channel.close().await;
        }
        if was_connected {
            self.ctx.handler.on_disconnected(&self.peer).await;
        }
    }

    async fn fail_attempt(&mut self, reason: Error) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!(peer = %self.peer, state = %self.state, error = %reason, "Connection lost");
        self.discard_attempt().await;
        self.set_state(PeerState::Disconnected);
        self.schedule_retry().await;
    }

    async fn schedule_retry(&mut self) {
        if !self.ctx.roster.contains(&self.peer).await {
            self.depart().await;
            return;
        }

        if self.backoff.allows(self.retry_count) {
            let delay = self.backoff.delay(self.retry_count);
            self.retry_count += 1;
            self.retry_at = Some(Instant::now() + delay);
            tracing::info!(
                peer = %self.peer,
                attempt = self.retry_count,
                max_attempts = self.backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnect scheduled"
            );
            self.publish();
        } else {
            tracing::warn!(
                peer = %self.peer,
                attempts = self.retry_count,
                "Reconnect attempts exhausted"
            );
            self.set_state(PeerState::Failed);
        }
    }

    async fn retry_due(&mut self) {
        self.retry_at = None;
        self.connect().await;
    }

    async fn depart(&mut self) {
        self.retry_at = None;
        self.discard_attempt().await;
        self.set_state(PeerState::Gone);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Signal(signal) => self.handle_signal(signal).await,
            Command::Retry => self.manual_retry().await,
            Command::RosterLeft => self.depart().await,
            Command::Shutdown => {}
        }
    }

    async fn manual_retry(&mut self) {
        match self.state {
            PeerState::Gone => return,
            PeerState::Connected => {
                tracing::debug!(peer = %self.peer, "Manual retry ignored, already connected");
                return;
            }
            _ => {}
        }
        tracing::info!(peer = %self.peer, "Manual retry");
        self.retry_count = 0;
        self.discard_attempt().await;
        self.connect().await;
    }

    // ============ Negotiation ============

    async fn handle_signal(&mut self, signal: Signal) {
        let negotiation_id = signal.negotiation_id();
        match signal {
            Signal::Offer { .. } => self.handle_offer(signal).await,
            Signal::Answer { .. } => {
                let result = match self.attempt.as_mut() {
                    Some(attempt) if attempt.channel.negotiation_id() == negotiation_id => {
                        match attempt.channel.apply_signal(signal).await {
                            Ok(()) => {
                                for candidate in std::mem::take(&mut attempt.pending_ice_like) {
                                    if let Err(e) = attempt.channel.apply_signal(candidate).await {
                                        tracing::debug!(error = %e, "Deferred candidate rejected");
                                    }
                                }
                                Ok(())
                            }
                            Err(e) => Err(Error::from(e)),
                        }
                    }
                    _ => {
                        tracing::debug!(peer = %self.peer, negotiation_id, "Ignoring stale answer");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    self.fail_attempt(e).await;
                }
            }
            Signal::Candidate { .. } => match self.attempt.as_mut() {
                Some(attempt) if attempt.channel.negotiation_id() == negotiation_id => {
                    if attempt.channel.has_remote_description() {
                        if let Err(e) = attempt.channel.apply_signal(signal).await {
                            tracing::debug!(peer = %self.peer, error = %e, "Candidate rejected");
                        }
                    } else {
                        attempt.pending_ice_like.push(signal);
                    }
                }
                _ => {
                    tracing::debug!(peer = %self.peer, negotiation_id, "Ignoring stale candidate");
                }
            },
        }
    }

    async fn handle_offer(&mut self, offer: Signal) {
        if self.state.is_terminal() {
            return;
        }
        let negotiation_id = offer.negotiation_id();

        if let Some(attempt) = &self.attempt {
            if attempt.channel.negotiation_id() == negotiation_id {
                tracing::debug!(peer = %self.peer, negotiation_id, "Duplicate offer");
                return;
            }
            let outstanding_local_offer = attempt.local_offer
                && !attempt.opened
                && !attempt.channel.has_remote_description();
            if outstanding_local_offer {
                if self.peer < self.ctx.local {
                    tracing::debug!(peer = %self.peer, "Glare: remote has priority, rolling back local offer");
                } else {
                    tracing::debug!(peer = %self.peer, "Glare: local offer has priority, ignoring remote offer");
                    return;
                }
            } else {
                tracing::debug!(peer = %self.peer, "Remote peer restarted negotiation");
            }
        }

        self.discard_attempt().await;
        match self.ctx.factory.on_incoming(&self.peer, offer).await {
            Ok(handle) => {
                self.retry_at = None;
                self.install_attempt(handle, false);
                self.set_state(PeerState::Connecting);
            }
            Err(e) => self.fail_attempt(e.into()).await,
        }
    }

    async fn forward_signal(&self, signal: Signal) {
        if let Err(e) = self
            .ctx
            .signaling
            .send_envelope(&self.peer, signal.to_value())
            .await
        {
            tracing::warn!(peer = %self.peer, kind = signal.kind(), error = %e, "Failed to forward signal");
        }
    }

    // ============ Channel events ============

    async fn handle_channel_event(&mut self, event: Option<ChannelEvent>) {
        let Some(event) = event else {
            self.fail_attempt(Error::channel_closed("channel event stream ended"))
                .await;
            return;
        };

        match event {
            ChannelEvent::Signal(signal) => self.forward_signal(signal).await,
            ChannelEvent::Open => self.on_open().await,
            ChannelEvent::Message(frame) => self.on_frame(frame).await,
            ChannelEvent::BufferedAmountLow => {
                if let Some(attempt) = &self.attempt {
                    attempt.link.notify_drained();
                }
            }
            ChannelEvent::Closed => {
                self.fail_attempt(Error::channel_closed("channel closed")).await;
            }
            ChannelEvent::Error(reason) => {
                tracing::warn!(peer = %self.peer, error = %reason, "Channel error");
                self.fail_attempt(Error::ChannelClosed(reason.into())).await;
            }
        }
    }

    async fn on_open(&mut self) {
        let encryption = self.ctx.config.encryption;
        let probe_deadline = Instant::now() + self.ctx.config.probe_timeout();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.opened = true;
        attempt.probe_deadline = Some(probe_deadline);

        if encryption {
            let agreement = KeyAgreement::new();
            let key = agreement.public_key().to_hex();
            attempt.key_agreement = Some(agreement);
            let link = attempt.link.clone();
            self.set_state(PeerState::KeyExchange);
            if let Err(e) = link.send_control(&ControlMessage::PublicKey { key }).await {
                self.fail_attempt(e).await;
            }
        } else {
            self.start_probe().await;
        }
    }

    async fn start_probe(&mut self) {
        let nonce: u64 = rand::random();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.probe_nonce = Some(nonce);
        let link = attempt.link.clone();
        tracing::trace!(peer = %self.peer, nonce, "Sending liveness probe");
        if let Err(e) = link
            .send_control(&ControlMessage::ConnectionTest { nonce })
            .await
        {
            self.fail_attempt(e).await;
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.keepalive.record_inbound();
        self.last_activity = Instant::now();

        match frame {
            Frame::Binary(data) => match attempt.pending_chunk.take() {
                Some(header) => self.deliver(Inbound::Chunk(header, data)).await,
                None => {
                    tracing::debug!(peer = %self.peer, len = data.len(), "Dropping binary frame without chunk metadata");
                }
            },
            Frame::Text(text) => self.on_text(&text).await,
        }
    }

    async fn on_text(&mut self, text: &str) {
        let wire = match WireMessage::parse(text) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match wire {
            WireMessage::Unknown(kind) => {
                tracing::debug!(peer = %self.peer, kind, "Ignoring unknown message type");
            }
            WireMessage::Plain(ControlMessage::PublicKey { key }) => self.on_public_key(&key).await,
            WireMessage::Plain(message) => {
                if self.ctx.config.encryption {
                    tracing::debug!(
                        peer = %self.peer,
                        kind = message.message_type(),
                        "Dropping plaintext message on encrypted session"
                    );
                } else {
                    self.dispatch(message).await;
                }
            }
            WireMessage::Encrypted(envelope) => {
                let cipher = self
                    .attempt
                    .as_ref()
                    .and_then(|attempt| attempt.link.cipher().cloned());
                let Some(cipher) = cipher else {
                    tracing::debug!(peer = %self.peer, "Dropping encrypted message received before key exchange");
                    return;
                };
                match envelope.open(&cipher) {
                    Ok(WireMessage::Plain(message)) => self.dispatch(message).await,
                    Ok(WireMessage::Unknown(kind)) => {
                        tracing::debug!(peer = %self.peer, kind, "Ignoring unknown message type");
                    }
                    Ok(WireMessage::Encrypted(_)) => {}
                    Err(e) if self.state == PeerState::Connected => {
                        tracing::warn!(peer = %self.peer, error = %e, "Dropping message that failed to open");
                    }
                    Err(_) => {
                        self.fail_attempt(Error::key_exchange("envelope failed to open"))
                            .await;
                    }
                }
            }
        }
    }

    async fn on_public_key(&mut self, key: &str) {
        if !self.ctx.config.encryption {
            tracing::debug!(peer = %self.peer, "Ignoring public key on unencrypted session");
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let Some(agreement) = attempt.key_agreement.take() else {
            tracing::debug!(peer = %self.peer, "Ignoring repeated public key");
            return;
        };

        match PublicKey::from_hex(key).and_then(|remote| agreement.complete(&remote)) {
            Ok(cipher) => {
                attempt.link.install_cipher(cipher);
                tracing::debug!(peer = %self.peer, "Key exchange complete");
                self.start_probe().await;
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Key exchange failed");
                self.fail_attempt(Error::key_exchange("invalid remote public key"))
                    .await;
            }
        }
    }

    /// Handle a decoded message that passed the encryption gate.
    async fn dispatch(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::ConnectionTest { nonce } => {
                let link = self.attempt.as_ref().map(|attempt| attempt.link.clone());
                if let Some(link) = link {
                    let response = ControlMessage::ConnectionTestResponse { nonce };
                    if let Err(e) = link.send_control(&response).await {
                        tracing::debug!(peer = %self.peer, error = %e, "Probe response not sent");
                    }
                }
            }
            ControlMessage::ConnectionTestResponse { nonce } => {
                let expected = self
                    .attempt
                    .as_ref()
                    .is_some_and(|attempt| attempt.probe_nonce == Some(nonce));
                if expected && self.state != PeerState::Connected {
                    self.on_connected().await;
                } else {
                    tracing::debug!(peer = %self.peer, nonce, "Ignoring stale probe response");
                }
            }
            ControlMessage::Keepalive { .. } => {
                tracing::trace!(peer = %self.peer, "Keepalive");
            }
            ControlMessage::Chunk {
                file_id,
                chunk_index,
                total_chunks,
            } => {
                if let Some(attempt) = self.attempt.as_mut() {
                    let header = ChunkHeader {
                        file_id,
                        chunk_index,
                        total_chunks,
                    };
                    if attempt.pending_chunk.replace(header).is_some() {
                        tracing::debug!(peer = %self.peer, "Chunk metadata superseded before its payload");
                    }
                }
            }
            ControlMessage::FileChunk {
                file_id,
                chunk_index,
                total_chunks,
                data,
            } => {
                let header = ChunkHeader {
                    file_id,
                    chunk_index,
                    total_chunks,
                };
                self.deliver(Inbound::Chunk(header, data)).await;
            }
            ControlMessage::PublicKey { .. } => {
                tracing::debug!(peer = %self.peer, "Ignoring enveloped public key");
            }
            other => self.deliver(Inbound::Message(other)).await,
        }
    }

    /// Hand application traffic on, holding it back until the session is
    /// Connected so the handler already has the link to answer on.
    async fn deliver(&mut self, inbound: Inbound) {
        if self.state != PeerState::Connected {
            let Some(attempt) = self.attempt.as_mut() else {
                return;
            };
            if attempt.early_inbound.len() < MAX_EARLY_INBOUND {
                attempt.early_inbound.push(inbound);
            } else {
                tracing::debug!(peer = %self.peer, "Dropping traffic received before the probe completed");
            }
            return;
        }
        match inbound {
            Inbound::Message(ControlMessage::Text { text }) => {
                let _ = self.ctx.events.send(Event::Text {
                    from: self.peer.clone(),
                    text,
                });
            }
            Inbound::Message(message) => self.ctx.handler.on_message(&self.peer, message).await,
            Inbound::Chunk(header, data) => self.ctx.handler.on_chunk(&self.peer, header, data).await,
        }
    }

    async fn on_connected(&mut self) {
        let interval = self.ctx.config.keepalive_interval();
        let max_missed = self.ctx.config.max_missed_keepalive;
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.probe_deadline = None;
        attempt.probe_nonce = None;
        attempt.keepalive = KeepaliveMonitor::new(max_missed);
        attempt.next_keepalive = Some(Instant::now() + interval);
        let link = attempt.link.clone();
        let early = std::mem::take(&mut attempt.early_inbound);

        self.retry_count = 0;
        tracing::info!(peer = %self.peer, encrypted = link.cipher().is_some(), "Peer connected");
        self.ctx.handler.on_connected(link).await;
        self.set_state(PeerState::Connected);

        if !early.is_empty() {
            tracing::debug!(peer = %self.peer, count = early.len(), "Delivering traffic held until connected");
        }
        for inbound in early {
            self.deliver(inbound).await;
        }
    }

    async fn keepalive_tick(&mut self) {
        let interval = self.ctx.config.keepalive_interval();
        let Some(link) = self.attempt.as_ref().map(|attempt| attempt.link.clone()) else {
            return;
        };
        let sent = link.send_control(&ControlMessage::keepalive()).await.is_ok();

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        match attempt.keepalive.tick(sent) {
            KeepaliveVerdict::Healthy => {
                attempt.next_keepalive = Some(Instant::now() + interval);
            }
            KeepaliveVerdict::Dead => {
                tracing::warn!(
                    peer = %self.peer,
                    missed = attempt.keepalive.missed(),
                    "Keepalive threshold reached"
                );
                self.fail_attempt(Error::channel_closed("missed keepalives"))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventStream, event_channel};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use peerdrop_discovery::{Member, SignalingResult};
    use peerdrop_transport::{MemoryNetwork, TransportResult};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Routes envelopes between sessions in one process.
    #[derive(Clone, Default)]
    struct Switchboard {
        /// (owner, remote) -> inbox of the session `owner` runs for `remote`
        sessions: Arc<DashMap<(PeerId, PeerId), mpsc::UnboundedSender<Signal>>>,
    }

    struct RoutedSignaling {
        local: PeerId,
        board: Switchboard,
    }

    #[async_trait]
    impl SignalingClient for RoutedSignaling {
        fn local_id(&self) -> &PeerId {
            &self.local
        }

        async fn join_room(&self, _room_id: &str) -> SignalingResult<()> {
            Ok(())
        }

        async fn send_envelope(&self, to: &PeerId, payload: serde_json::Value) -> SignalingResult<()> {
            let Some(signal) = Signal::from_value(&payload) else {
                return Ok(());
            };
            if let Some(tx) = self.board.sessions.get(&(to.clone(), self.local.clone())) {
                let _ = tx.send(signal);
            }
            Ok(())
        }
    }

    struct CountingFactory {
        inner: Box<dyn ChannelFactory>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl ChannelFactory for CountingFactory {
        async fn open(&self, peer: &PeerId) -> TransportResult<ChannelHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open(peer).await
        }

        async fn on_incoming(&self, peer: &PeerId, offer: Signal) -> TransportResult<ChannelHandle> {
            self.inner.on_incoming(peer, offer).await
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        log: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerHandler for RecordingHandler {
        async fn on_connected(&self, link: PeerLink) {
            self.log.lock().unwrap().push(format!("connected {}", link.peer()));
        }

        async fn on_disconnected(&self, peer: &PeerId) {
            self.log.lock().unwrap().push(format!("disconnected {peer}"));
        }

        async fn on_message(&self, peer: &PeerId, message: ControlMessage) {
            self.log
                .lock()
                .unwrap()
                .push(format!("message {peer} {}", message.message_type()));
        }

        async fn on_chunk(&self, peer: &PeerId, header: ChunkHeader, data: Vec<u8>) {
            self.log.lock().unwrap().push(format!(
                "chunk {peer} {} {} {}",
                header.file_id,
                header.chunk_index,
                data.len()
            ));
        }
    }

    struct Node {
        handle: PeerSessionHandle,
        handler: Arc<RecordingHandler>,
        factory: Arc<CountingFactory>,
        roster: Roster,
        events: EventStream,
    }

    fn fast_config() -> PeerConfig {
        PeerConfig {
            connection_timeout_ms: 2_000,
            probe_timeout_ms: 1_000,
            keepalive_interval_ms: 200,
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 200,
            reconnect_jitter: false,
            ..PeerConfig::default()
        }
    }

    async fn node(
        network: &MemoryNetwork,
        board: &Switchboard,
        local: &str,
        remote: &str,
        config: PeerConfig,
    ) -> Node {
        let local = PeerId::from(local);
        let remote = PeerId::from(remote);
        let roster = Roster::new();
        roster.insert(Member::new(remote.clone(), "remote")).await;
        let handler = Arc::new(RecordingHandler::default());
        let factory = Arc::new(CountingFactory {
            inner: Box::new(network.factory(local.clone())),
            opens: AtomicUsize::new(0),
        });
        let (events_tx, events) = event_channel();
        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        board
            .sessions
            .insert((local.clone(), remote.clone()), signals_tx);

        let ctx = SessionContext {
            local: local.clone(),
            config,
            high_water: 64 * 1024,
            signaling: Arc::new(RoutedSignaling {
                local: local.clone(),
                board: board.clone(),
            }),
            factory: factory.clone(),
            roster: roster.clone(),
            handler: handler.clone(),
            events: events_tx,
        };
        let handle = PeerSessionHandle::spawn(ctx, remote);
        let commands = handle.commands.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let _ = commands.send(Command::Signal(signal));
            }
        });

        Node {
            handle,
            handler,
            factory,
            roster,
            events,
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_encrypted_sessions_connect() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let a = node(&network, &board, "a", "b", fast_config()).await;
        let b = node(&network, &board, "b", "a", fast_config()).await;

        let connected = |s: PeerState| s == PeerState::Connected;
        assert_eq!(a.handle.wait_for_state(WAIT, connected).await, Some(PeerState::Connected));
        assert_eq!(b.handle.wait_for_state(WAIT, connected).await, Some(PeerState::Connected));

        assert!(a.handle.link().unwrap().cipher().is_some());
        assert_eq!(a.handle.retry_count(), 0);
        assert!(a.handler.entries().contains(&"connected b".to_string()));
        assert_eq!(
            network.open_channels(&PeerId::from("a"), &PeerId::from("b")).await,
            1
        );
    }

    #[tokio::test]
    async fn test_text_and_transfer_messages_routed() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let config = PeerConfig {
            encryption: false,
            ..fast_config()
        };
        let a = node(&network, &board, "a", "b", config.clone()).await;
        let mut b = node(&network, &board, "b", "a", config).await;

        let connected = |s: PeerState| s == PeerState::Connected;
        a.handle.wait_for_state(WAIT, connected).await.unwrap();
        b.handle.wait_for_state(WAIT, connected).await.unwrap();

        let link = a.handle.link().unwrap();
        link.send_control(&ControlMessage::Text { text: "hello".into() })
            .await
            .unwrap();
        link.send_control(&ControlMessage::FileAccept { file_id: "f".into() })
            .await
            .unwrap();
        link.send_chunk("f", 0, 1, vec![7; 10]).await.unwrap();

        let text = loop {
            match tokio::time::timeout(WAIT, b.events.recv()).await.unwrap() {
                Some(Event::Text { from, text }) => break (from, text),
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        };
        assert_eq!(text, (PeerId::from("a"), "hello".to_string()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let entries = b.handler.entries();
        assert!(entries.contains(&"message a file-accept".to_string()));
        assert!(entries.contains(&"chunk a f 0 10".to_string()));
    }

    #[tokio::test]
    async fn test_traffic_before_probe_response_is_held_until_connected() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let (a, b_id) = (PeerId::from("a"), PeerId::from("b"));

        // "a" is driven by hand over a raw channel
        let (to_a, mut a_inbox) = mpsc::unbounded_channel();
        board.sessions.insert((a.clone(), b_id.clone()), to_a);
        let config = PeerConfig {
            encryption: false,
            ..fast_config()
        };
        let mut b = node(&network, &board, "b", "a", config).await;
        let to_b = board
            .sessions
            .get(&(b_id.clone(), a.clone()))
            .map(|entry| entry.value().clone())
            .unwrap();

        let offer = tokio::time::timeout(WAIT, a_inbox.recv()).await.unwrap().unwrap();
        let ChannelHandle {
            channel,
            mut events,
        } = network.factory(a.clone()).on_incoming(&b_id, offer).await.unwrap();

        let nonce = tokio::time::timeout(WAIT, async {
            loop {
                tokio::select! {
                    Some(signal) = a_inbox.recv() => {
                        let _ = channel.apply_signal(signal).await;
                    }
                    Some(event) = events.recv() => match event {
                        ChannelEvent::Signal(signal) => {
                            let _ = to_b.send(signal);
                        }
                        ChannelEvent::Message(Frame::Text(text)) => {
                            if let Ok(WireMessage::Plain(ControlMessage::ConnectionTest { nonce })) =
                                WireMessage::parse(&text)
                            {
                                break nonce;
                            }
                        }
                        _ => {}
                    },
                }
            }
        })
        .await
        .unwrap();

        let text = |message: ControlMessage| Frame::Text(WireMessage::encode(&message, None).unwrap());
        channel
            .send(text(ControlMessage::Text { text: "early".into() }))
            .await
            .unwrap();
        channel
            .send(text(ControlMessage::FileAccept { file_id: "f".into() }))
            .await
            .unwrap();
        channel
            .send(text(ControlMessage::Chunk {
                file_id: "f".into(),
                chunk_index: 0,
                total_chunks: 1,
            }))
            .await
            .unwrap();
        channel.send(Frame::Binary(vec![7; 10])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.handler.entries().is_empty());
        assert_ne!(b.handle.state(), PeerState::Connected);

        channel
            .send(text(ControlMessage::ConnectionTestResponse { nonce }))
            .await
            .unwrap();
        b.handle
            .wait_for_state(WAIT, |s| s == PeerState::Connected)
            .await
            .unwrap();

        let early = loop {
            match tokio::time::timeout(WAIT, b.events.recv()).await.unwrap() {
                Some(Event::Text { text, .. }) => break text,
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        };
        assert_eq!(early, "early");
        let entries = b.handler.entries();
        assert_eq!(
            entries[..3],
            [
                "connected a".to_string(),
                "message a file-accept".to_string(),
                "chunk a f 0 10".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unanswered_probe_takes_retry_path() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let config = PeerConfig {
            encryption: false,
            probe_timeout_ms: 200,
            reconnect_base_delay_ms: 10_000,
            reconnect_max_delay_ms: 10_000,
            ..fast_config()
        };
        network
            .set_blackhole(&PeerId::from("b"), &PeerId::from("a"), true)
            .await;
        let a = node(&network, &board, "a", "b", config.clone()).await;
        let _b = node(&network, &board, "b", "a", config).await;

        let state = a
            .handle
            .wait_for_state(WAIT, |s| s == PeerState::Disconnected)
            .await;
        assert_eq!(state, Some(PeerState::Disconnected));
        assert_eq!(a.handle.retry_count(), 1);
        assert!(a.handle.link().is_none());
    }

    #[tokio::test]
    async fn test_silent_connected_channel_disconnects_after_missed_keepalives() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let config = PeerConfig {
            encryption: false,
            keepalive_interval_ms: 100,
            max_missed_keepalive: 3,
            reconnect_base_delay_ms: 10_000,
            reconnect_max_delay_ms: 10_000,
            ..fast_config()
        };
        let a = node(&network, &board, "a", "b", config.clone()).await;
        let b = node(&network, &board, "b", "a", config).await;

        let connected = |s: PeerState| s == PeerState::Connected;
        a.handle.wait_for_state(WAIT, connected).await.unwrap();
        b.handle.wait_for_state(WAIT, connected).await.unwrap();
        assert_eq!(a.handle.retry_count(), 0);

        // The channel stays open, but nothing from b reaches a any more
        network
            .set_blackhole(&PeerId::from("b"), &PeerId::from("a"), true)
            .await;
        let started = Instant::now();
        let state = a
            .handle
            .wait_for_state(WAIT, |s| s == PeerState::Disconnected)
            .await;
        assert_eq!(state, Some(PeerState::Disconnected));
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert!(a.handle.link().is_none());
        assert_eq!(a.handle.retry_count(), 1);
        assert!(a.handler.entries().contains(&"disconnected b".to_string()));
    }

    #[tokio::test]
    async fn test_retry_rechecks_roster() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let config = PeerConfig {
            connection_timeout_ms: 100,
            reconnect_base_delay_ms: 300,
            reconnect_max_delay_ms: 300,
            ..fast_config()
        };
        // No session on the other side: every attempt times out.
        let a = node(&network, &board, "a", "b", config).await;

        a.handle
            .wait_for_state(WAIT, |s| s == PeerState::Disconnected)
            .await
            .unwrap();
        a.roster.remove(&PeerId::from("b")).await;

        let state = a.handle.wait_for_state(WAIT, |s| s == PeerState::Gone).await;
        assert_eq!(state, Some(PeerState::Gone));
        assert_eq!(a.factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_then_manual_retry() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let config = PeerConfig {
            connection_timeout_ms: 50,
            max_reconnect_attempts: 2,
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 20,
            ..fast_config()
        };
        let mut a = node(&network, &board, "a", "b", config).await;

        let state = a.handle.wait_for_state(WAIT, |s| s == PeerState::Failed).await;
        assert_eq!(state, Some(PeerState::Failed));
        assert_eq!(a.handle.retry_count(), 2);
        assert_eq!(a.factory.opens.load(Ordering::SeqCst), 3);

        while a.events.try_recv().is_ok() {}
        assert!(a.handle.retry());

        // A manual retry restores the full budget: three more opens, then Failed again.
        let mut states = Vec::new();
        loop {
            match tokio::time::timeout(WAIT, a.events.recv()).await.unwrap() {
                Some(Event::PeerStateChanged { state, .. }) => {
                    states.push(state);
                    if state == PeerState::Failed {
                        break;
                    }
                }
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
        assert_eq!(states.first(), Some(&PeerState::Connecting));
        assert_eq!(a.factory.opens.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_channel_loss_notifies_handler_and_reconnects() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let a = node(&network, &board, "a", "b", fast_config()).await;
        let b = node(&network, &board, "b", "a", fast_config()).await;

        let connected = |s: PeerState| s == PeerState::Connected;
        a.handle.wait_for_state(WAIT, connected).await.unwrap();
        b.handle.wait_for_state(WAIT, connected).await.unwrap();

        assert!(network.sever(&PeerId::from("a"), &PeerId::from("b")).await > 0);

        let reconnected = async {
            loop {
                let entries = a.handler.entries();
                if entries.iter().filter(|e| *e == "connected b").count() == 2 {
                    break entries;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let entries = tokio::time::timeout(WAIT, reconnected).await.unwrap();
        b.handle.wait_for_state(WAIT, connected).await.unwrap();
        assert_eq!(
            entries.iter().filter(|e| *e == "disconnected b").count(),
            1
        );
        assert_eq!(entries.iter().filter(|e| *e == "connected b").count(), 2);
    }

    #[tokio::test]
    async fn test_retire_goes_gone() {
        let network = MemoryNetwork::new();
        let board = Switchboard::default();
        let mut a = node(&network, &board, "a", "b", fast_config()).await;

        a.handle.retire();
        let state = a.handle.wait_for_state(WAIT, |s| s == PeerState::Gone).await;
        assert_eq!(state, Some(PeerState::Gone));

        let mut saw_gone = false;
        while let Ok(event) = a.events.try_recv() {
            if let Event::PeerStateChanged { state: PeerState::Gone, .. } = event {
                saw_gone = true;
            }
        }
        assert!(saw_gone);
    }
}
