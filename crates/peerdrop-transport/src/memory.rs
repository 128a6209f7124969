//! In-memory channel network.
//!
//! [`MemoryNetwork`] connects any number of [`MemoryChannelFactory`]s in one
//! process. Negotiation follows the browser flow: the offerer's factory emits
//! an offer and a candidate, the answerer's factory answers, and the channel
//! opens on both ends when the offerer applies the answer.
//!
//! Each endpoint runs a delivery task that drains its outbound queue, so
//! `buffered_amount` behaves like a real data channel: it grows on `send`,
//! shrinks on delivery, and crossing the low threshold downward emits
//! [`ChannelEvent::BufferedAmountLow`].
//!
//! Fault injection for tests:
//! - [`MemoryNetwork::set_link_config`]: per-frame latency and bandwidth
//! - [`MemoryNetwork::set_blackhole`]: channel stays open but frames from one
//!   side are silently dropped (half-open link)
//! - [`MemoryNetwork::set_unreachable`]: negotiations complete on the
//!   signaling level but the channel never opens
//! - [`MemoryNetwork::sever`]: close every open channel between two peers

use crate::channel::{
    Channel, ChannelEvent, ChannelHandle, ChannelState, ChannelStats, Frame, TransportError,
    TransportResult,
};
use crate::factory::ChannelFactory;
use crate::signal::{NegotiationId, Signal, new_negotiation_id};
use async_trait::async_trait;
use peerdrop_discovery::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};

/// Simulated link characteristics
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Fixed delay applied to every frame
    pub frame_delay: Duration,
    /// Bandwidth cap; `None` delivers as fast as the runtime allows
    pub bytes_per_sec: Option<u64>,
}

impl LinkConfig {
    fn delay_for(&self, len: usize) -> Duration {
        let transmit = match self.bytes_per_sec {
            Some(bps) if bps > 0 => Duration::from_secs_f64(len as f64 / bps as f64),
            _ => Duration::ZERO,
        };
        self.frame_delay + transmit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

enum Outbound {
    Frame(Frame),
    Shutdown,
}

struct Negotiation {
    offerer: Weak<Endpoint>,
    answerer: Option<Weak<Endpoint>>,
}

#[derive(Default)]
struct NetworkInner {
    link: RwLock<LinkConfig>,
    negotiations: Mutex<HashMap<NegotiationId, Negotiation>>,
    endpoints: Mutex<Vec<Weak<Endpoint>>>,
    blackholes: RwLock<HashSet<(PeerId, PeerId)>>,
    unreachable: RwLock<HashSet<(PeerId, PeerId)>>,
}

fn pair_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl NetworkInner {
    /// Open both ends of a negotiation once the offerer has the answer.
    async fn complete(&self, negotiation_id: NegotiationId) {
        let Some(negotiation) = self.negotiations.lock().await.remove(&negotiation_id) else {
            return;
        };
        let offerer = negotiation.offerer.upgrade();
        let answerer = negotiation.answerer.and_then(|weak| weak.upgrade());
        let (Some(offerer), Some(answerer)) = (offerer, answerer) else {
            tracing::debug!(negotiation_id, "Negotiation peer vanished before completion");
            return;
        };
        if offerer.state() != ChannelState::Connecting || answerer.state() != ChannelState::Connecting
        {
            return;
        }
        if self
            .unreachable
            .read()
            .await
            .contains(&pair_key(&offerer.local, &offerer.remote))
        {
            tracing::debug!(
                negotiation_id,
                local = %offerer.local,
                remote = %offerer.remote,
                "Link unreachable, channel will not open"
            );
            return;
        }

        let _ = offerer.counterpart.set(Arc::downgrade(&answerer));
        let _ = answerer.counterpart.set(Arc::downgrade(&offerer));
        offerer.mark_open();
        answerer.mark_open();
    }

    async fn register(&self, endpoint: &Arc<Endpoint>) {
        let mut endpoints = self.endpoints.lock().await;
        endpoints.retain(|weak| weak.strong_count() > 0);
        endpoints.push(Arc::downgrade(endpoint));
    }

    async fn live_endpoints(&self, local: &PeerId, remote: &PeerId) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .await
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|ep| &ep.local == local && &ep.remote == remote)
            .collect()
    }
}

struct Endpoint {
    local: PeerId,
    remote: PeerId,
    negotiation_id: NegotiationId,
    role: Role,
    network: Weak<NetworkInner>,
    state: AtomicU8,
    has_remote: AtomicBool,
    counterpart: OnceLock<Weak<Endpoint>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    stats: std::sync::Mutex<ChannelStats>,
}

impl Endpoint {
    fn spawn(
        network: &Arc<NetworkInner>,
        local: PeerId,
        remote: PeerId,
        negotiation_id: NegotiationId,
        role: Role,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Self {
            local,
            remote,
            negotiation_id,
            role,
            network: Arc::downgrade(network),
            state: AtomicU8::new(ChannelState::Connecting as u8),
            has_remote: AtomicBool::new(role == Role::Answerer),
            counterpart: OnceLock::new(),
            events,
            outbound,
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            stats: std::sync::Mutex::new(ChannelStats::default()),
        });

        tokio::spawn(deliver(
            Arc::downgrade(&endpoint),
            outbound_rx,
            Arc::downgrade(network),
        ));

        (endpoint, events_rx)
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn mark_open(&self) {
        if self
            .state
            .compare_exchange(
                ChannelState::Connecting as u8,
                ChannelState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.emit(ChannelEvent::Open);
        }
    }

    /// Transition to `Closed`; returns false if already closed.
    fn mark_closed(&self) -> bool {
        let previous = self
            .state
            .swap(ChannelState::Closed as u8, Ordering::AcqRel);
        if ChannelState::from_u8(previous) == ChannelState::Closed {
            return false;
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        self.emit(ChannelEvent::Closed);
        true
    }

    fn counterpart(&self) -> Option<Arc<Endpoint>> {
        self.counterpart.get().and_then(Weak::upgrade)
    }

    fn record_recv(&self, len: usize) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record_recv(len);
        }
    }
}

/// Delivery task: drains one endpoint's outbound queue into its counterpart.
async fn deliver(
    endpoint: Weak<Endpoint>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    network: Weak<NetworkInner>,
) {
    while let Some(item) = rx.recv().await {
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Shutdown => break,
        };
        let Some(net) = network.upgrade() else {
            break;
        };

        let delay = net.link.read().await.delay_for(frame.len());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some(ep) = endpoint.upgrade() else {
            break;
        };
        let len = frame.len();
        let blackholed = net
            .blackholes
            .read()
            .await
            .contains(&(ep.local.clone(), ep.remote.clone()));

        if !blackholed && ep.state() == ChannelState::Open {
            if let Some(peer) = ep.counterpart() {
                if peer.state() == ChannelState::Open {
                    peer.record_recv(len);
                    peer.emit(ChannelEvent::Message(frame));
                }
            }
        }

        let before = ep.buffered.fetch_sub(len, Ordering::AcqRel);
        let after = before.saturating_sub(len);
        let threshold = ep.low_threshold.load(Ordering::Acquire);
        if before > threshold && after <= threshold {
            ep.emit(ChannelEvent::BufferedAmountLow);
        }
    }
}

/// One end of an in-memory channel.
pub struct MemoryChannel {
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn peer_id(&self) -> &PeerId {
        &self.endpoint.remote
    }

    fn negotiation_id(&self) -> NegotiationId {
        self.endpoint.negotiation_id
    }

    fn state(&self) -> ChannelState {
        self.endpoint.state()
    }

    fn has_remote_description(&self) -> bool {
        self.endpoint.has_remote.load(Ordering::Acquire)
    }

    async fn apply_signal(&self, signal: Signal) -> TransportResult<()> {
        let ep = &self.endpoint;
        if signal.negotiation_id() != ep.negotiation_id {
            return Err(TransportError::InvalidState(format!(
                "{} for negotiation {} applied to negotiation {}",
                signal.kind(),
                signal.negotiation_id(),
                ep.negotiation_id
            )));
        }
        if ep.state() == ChannelState::Closed {
            return Err(TransportError::Closed);
        }

        match signal {
            Signal::Answer { .. } => {
                if ep.role != Role::Offerer {
                    return Err(TransportError::InvalidState(
                        "answer applied to answering side".into(),
                    ));
                }
                if ep.has_remote.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                if let Some(network) = ep.network.upgrade() {
                    network.complete(ep.negotiation_id).await;
                }
                Ok(())
            }
            Signal::Candidate { .. } => {
                if !self.has_remote_description() {
                    return Err(TransportError::InvalidState(
                        "candidate applied before remote description".into(),
                    ));
                }
                Ok(())
            }
            Signal::Offer { .. } => Err(TransportError::InvalidState(
                "offers are answered through the factory".into(),
            )),
        }
    }

    async fn send(&self, frame: Frame) -> TransportResult<()> {
        let ep = &self.endpoint;
        if ep.state() != ChannelState::Open {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        let after = ep.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if let Ok(mut stats) = ep.stats.lock() {
            stats.record_send(len, after);
        }
        ep.outbound.send(Outbound::Frame(frame)).map_err(|_| {
            ep.buffered.fetch_sub(len, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.endpoint.buffered.load(Ordering::Acquire)
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.endpoint.low_threshold.load(Ordering::Acquire)
    }

    fn set_buffered_amount_low_threshold(&self, bytes: usize) {
        self.endpoint.low_threshold.store(bytes, Ordering::Release);
    }

    async fn close(&self) {
        let ep = &self.endpoint;
        if !ep.mark_closed() {
            return;
        }
        if let Some(peer) = ep.counterpart() {
            peer.mark_closed();
        }
        if let Some(network) = ep.network.upgrade() {
            network.negotiations.lock().await.remove(&ep.negotiation_id);
        }
        tracing::trace!(local = %ep.local, remote = %ep.remote, "Memory channel closed");
    }

    fn stats(&self) -> ChannelStats {
        self.endpoint
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

/// In-process network connecting memory channel factories.
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory creating channels on behalf of `local`.
    #[must_use]
    pub fn factory(&self, local: PeerId) -> MemoryChannelFactory {
        MemoryChannelFactory {
            local,
            network: Arc::clone(&self.inner),
        }
    }

    /// Replace the simulated link characteristics for all channels.
    pub async fn set_link_config(&self, config: LinkConfig) {
        *self.inner.link.write().await = config;
    }

    /// Silently drop frames sent from `from` to `to` while keeping the
    /// channel open.
    pub async fn set_blackhole(&self, from: &PeerId, to: &PeerId, enabled: bool) {
        let key = (from.clone(), to.clone());
        let mut blackholes = self.inner.blackholes.write().await;
        if enabled {
            blackholes.insert(key);
        } else {
            blackholes.remove(&key);
        }
    }

    /// Prevent channels between `a` and `b` from ever opening.
    pub async fn set_unreachable(&self, a: &PeerId, b: &PeerId, enabled: bool) {
        let key = pair_key(a, b);
        let mut unreachable = self.inner.unreachable.write().await;
        if enabled {
            unreachable.insert(key);
        } else {
            unreachable.remove(&key);
        }
    }

    /// Close every live channel between `a` and `b`. Returns how many
    /// endpoints were closed.
    pub async fn sever(&self, a: &PeerId, b: &PeerId) -> usize {
        let mut endpoints = self.inner.live_endpoints(a, b).await;
        endpoints.extend(self.inner.live_endpoints(b, a).await);

        let mut closed = 0;
        for ep in endpoints {
            if ep.state() == ChannelState::Open && ep.mark_closed() {
                closed += 1;
            }
        }
        tracing::debug!(a = %a, b = %b, closed, "Severed link");
        closed
    }

    /// Number of open channels from `local` to `remote`.
    pub async fn open_channels(&self, local: &PeerId, remote: &PeerId) -> usize {
        self.inner
            .live_endpoints(local, remote)
            .await
            .iter()
            .filter(|ep| ep.state() == ChannelState::Open)
            .count()
    }

    /// Largest buffered amount any channel from `local` to `remote` reached.
    pub async fn peak_buffered(&self, local: &PeerId, remote: &PeerId) -> usize {
        self.inner
            .live_endpoints(local, remote)
            .await
            .iter()
            .filter_map(|ep| ep.stats.lock().ok().map(|stats| stats.peak_buffered))
            .max()
            .unwrap_or(0)
    }
}

/// Channel factory bound to one local peer of a [`MemoryNetwork`].
pub struct MemoryChannelFactory {
    local: PeerId,
    network: Arc<NetworkInner>,
}

impl MemoryChannelFactory {
    /// Peer this factory creates channels for.
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl ChannelFactory for MemoryChannelFactory {
    async fn open(&self, peer: &PeerId) -> TransportResult<ChannelHandle> {
        let negotiation_id = new_negotiation_id();
        let (endpoint, events) = Endpoint::spawn(
            &self.network,
            self.local.clone(),
            peer.clone(),
            negotiation_id,
            Role::Offerer,
        );

        self.network.negotiations.lock().await.insert(
            negotiation_id,
            Negotiation {
                offerer: Arc::downgrade(&endpoint),
                answerer: None,
            },
        );
        self.network.register(&endpoint).await;

        endpoint.emit(ChannelEvent::Signal(Signal::Offer {
            negotiation_id,
            sdp: format!("memory-offer {} {}", self.local, peer),
        }));
        endpoint.emit(ChannelEvent::Signal(Signal::Candidate {
            negotiation_id,
            candidate: format!("memory-host {}", self.local),
        }));

        Ok(ChannelHandle {
            channel: Arc::new(MemoryChannel { endpoint }),
            events,
        })
    }

    async fn on_incoming(&self, peer: &PeerId, offer: Signal) -> TransportResult<ChannelHandle> {
        let Signal::Offer { negotiation_id, .. } = offer else {
            return Err(TransportError::InvalidState(format!(
                "expected offer, got {}",
                offer.kind()
            )));
        };

        let mut negotiations = self.network.negotiations.lock().await;
        let Some(negotiation) = negotiations.get_mut(&negotiation_id) else {
            return Err(TransportError::NegotiationFailed(format!(
                "negotiation {negotiation_id} unknown or rolled back"
            )));
        };
        let offerer_matches = negotiation
            .offerer
            .upgrade()
            .is_some_and(|ep| &ep.local == peer && ep.remote == self.local);
        if !offerer_matches {
            return Err(TransportError::NegotiationFailed(format!(
                "negotiation {negotiation_id} does not belong to {peer}"
            )));
        }
        if negotiation.answerer.is_some() {
            return Err(TransportError::NegotiationFailed(format!(
                "negotiation {negotiation_id} already answered"
            )));
        }

        let (endpoint, events) = Endpoint::spawn(
            &self.network,
            self.local.clone(),
            peer.clone(),
            negotiation_id,
            Role::Answerer,
        );
        negotiation.answerer = Some(Arc::downgrade(&endpoint));
        drop(negotiations);
        self.network.register(&endpoint).await;

        endpoint.emit(ChannelEvent::Signal(Signal::Answer {
            negotiation_id,
            sdp: format!("memory-answer {} {}", self.local, peer),
        }));
        endpoint.emit(ChannelEvent::Signal(Signal::Candidate {
            negotiation_id,
            candidate: format!("memory-host {}", self.local),
        }));

        Ok(ChannelHandle {
            channel: Arc::new(MemoryChannel { endpoint }),
            events,
        })
    }
}
