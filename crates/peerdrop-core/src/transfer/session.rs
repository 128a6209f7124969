//! Transfer session state machine.
//!
//! ```text
//!            accept               first chunk
//! Waiting ──────────▶ Accepted ──────────────▶ Transferring ──▶ Completed
//!    │                   │                      │     ▲
//!    │ reject            │                pause │     │ resume
//!    ▼                   ▼                      ▼     │
//! (dropped)           Paused ◀───────────────── Paused
//!
//! any non-terminal state ──cancel──▶ Cancelled
//! any non-terminal state ──error───▶ Failed ──retry──▶ Accepted
//! ```
//!
//! A receive session owns the chunk store for one sender. A send session
//! owns one independent [`SendStream`] per accepting peer, so a slow peer
//! never holds back a fast one.

use super::speed::{ProgressSample, ProgressTracker};
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::protocol::{FileId, FileOffer};
use peerdrop_crypto::digest_hex;
use peerdrop_discovery::PeerId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Transfer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Offer outstanding
    Waiting,
    /// Accepted, no chunk moved yet
    Accepted,
    /// Chunks flowing
    Transferring,
    /// Suspended by the user or by a disconnect
    Paused,
    /// All chunks delivered (receive: assembled and verified)
    Completed,
    /// Integrity failure, sender departure or source error
    Failed,
    /// Cancelled by either side, or nobody accepted
    Cancelled,
}

impl TransferState {
    /// Completed, Failed or Cancelled
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Waiting => "waiting",
            TransferState::Accepted => "accepted",
            TransferState::Transferring => "transferring",
            TransferState::Paused => "paused",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sending file
    Send,
    /// Receiving file
    Receive,
}

/// Result of storing a received chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New chunk stored
    Stored {
        /// Every slot is now present
        complete: bool,
    },
    /// Slot already present; nothing changed
    Duplicate,
}

/// State of one peer's send stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Chunks being sent
    Active,
    /// Suspended until reconnect or user resume
    Paused,
    /// Every planned chunk sent and flushed
    Done,
}

/// Next action for a stream's pump task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStep {
    /// Send chunk `index`, `len` bytes at `offset`
    Send {
        /// Chunk index
        index: u64,
        /// Byte offset in the source
        offset: u64,
        /// Chunk length
        len: usize,
    },
    /// Nothing left in the plan
    Drained,
    /// Stream paused, removed or transfer stopped; the pump has been released
    Stop,
}

/// Per-peer outbound position.
#[derive(Debug, Clone)]
pub struct SendStream {
    cursor: u64,
    resend: BTreeSet<u64>,
    state: StreamState,
    pump_active: bool,
    bytes_sent: u64,
    chunks_sent: u64,
    progress: ProgressTracker,
}

impl SendStream {
    /// Next index in sequential order
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Stream state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Chunks sent, counting resends
    #[must_use]
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    fn has_work(&self, total_chunks: u64) -> bool {
        !self.resend.is_empty() || self.cursor < total_chunks
    }
}

/// One file transfer, in either direction.
#[derive(Debug)]
pub struct TransferSession {
    offer: FileOffer,
    direction: Direction,
    state: TransferState,
    user_paused: bool,
    config: TransferConfig,

    // Receive side
    chunk_store: Vec<Option<Vec<u8>>>,
    received_count: u64,
    bytes_received: u64,
    receive_progress: ProgressTracker,

    // Send side
    pending: HashSet<PeerId>,
    streams: HashMap<PeerId, SendStream>,
}

impl TransferSession {
    /// Create an outbound session offered to `recipients`.
    #[must_use]
    pub fn new_send(
        offer: FileOffer,
        recipients: impl IntoIterator<Item = PeerId>,
        config: &TransferConfig,
    ) -> Self {
        let mut session = Self::new(offer, Direction::Send, config);
        session.pending = recipients.into_iter().collect();
        session
    }

    /// Create an inbound session for a received offer.
    #[must_use]
    pub fn new_receive(offer: FileOffer, config: &TransferConfig) -> Self {
        let mut session = Self::new(offer, Direction::Receive, config);
        session.chunk_store = empty_store(session.offer.total_chunks);
        session
    }

    fn new(offer: FileOffer, direction: Direction, config: &TransferConfig) -> Self {
        Self {
            offer,
            direction,
            state: TransferState::Waiting,
            user_paused: false,
            config: config.clone(),
            chunk_store: Vec::new(),
            received_count: 0,
            bytes_received: 0,
            receive_progress: tracker(config),
            pending: HashSet::new(),
            streams: HashMap::new(),
        }
    }

    /// Transfer identifier
    #[must_use]
    pub fn file_id(&self) -> &FileId {
        &self.offer.file_id
    }

    /// The offer this session was created from
    #[must_use]
    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    /// Transfer direction
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Whether the user paused this transfer
    #[must_use]
    pub fn user_paused(&self) -> bool {
        self.user_paused
    }

    /// Offering peer
    #[must_use]
    pub fn sender(&self) -> &PeerId {
        &self.offer.sender_id
    }

    /// Chunk count
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        self.offer.total_chunks
    }

    /// Received chunk count
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    /// Peers that have not answered the offer yet
    #[must_use]
    pub fn pending_peers(&self) -> Vec<PeerId> {
        self.pending.iter().cloned().collect()
    }

    /// Whether `peer` has not answered the offer yet
    #[must_use]
    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.pending.contains(peer)
    }

    /// Send stream of `peer`
    #[must_use]
    pub fn stream(&self, peer: &PeerId) -> Option<&SendStream> {
        self.streams.get(peer)
    }

    /// Peers with a send stream
    #[must_use]
    pub fn stream_peers(&self) -> Vec<PeerId> {
        self.streams.keys().cloned().collect()
    }

    /// Length chunk `index` must have, `None` if out of range.
    #[must_use]
    pub fn expected_chunk_len(&self, index: u64) -> Option<usize> {
        expected_chunk_len(self.offer.file_size, self.offer.chunk_size, index)
    }

    // ============ Receive side ============

    /// Accept the offer
    pub fn accept(&mut self) {
        if self.state == TransferState::Waiting {
            self.state = TransferState::Accepted;
        }
    }

    /// Store a received chunk.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState` if the session is not accepting chunks
    /// - `Error::Protocol` if the index is out of range or the length is
    ///   wrong for that index
    pub fn store_chunk(&mut self, index: u64, data: Vec<u8>) -> Result<ChunkOutcome> {
        if self.direction != Direction::Receive {
            return Err(Error::invalid_state("chunk for an outbound transfer"));
        }
        if !matches!(
            self.state,
            TransferState::Accepted | TransferState::Transferring
        ) {
            return Err(Error::invalid_state("transfer is not receiving"));
        }
        let expected = self
            .expected_chunk_len(index)
            .ok_or(Error::protocol("chunk index out of range"))?;
        if data.len() != expected {
            return Err(Error::protocol("chunk length does not match its index"));
        }

        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.chunk_store.get_mut(i))
            .ok_or(Error::protocol("chunk index out of range"))?;
        if slot.is_some() {
            return Ok(ChunkOutcome::Duplicate);
        }

        *slot = Some(data);
        self.received_count += 1;
        self.bytes_received += expected as u64;
        self.receive_progress.record(expected as u64);
        self.state = TransferState::Transferring;

        Ok(ChunkOutcome::Stored {
            complete: self.received_count == self.offer.total_chunks,
        })
    }

    /// Indices not yet received, ascending
    #[must_use]
    pub fn missing_chunks(&self) -> Vec<u64> {
        self.chunk_store
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// Whether every chunk is present
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_count == self.offer.total_chunks
    }

    /// Concatenate the chunks and verify the offered digest.
    ///
    /// On success the session is `Completed` and the store is handed to the
    /// caller. On a digest mismatch the session is `Failed` and can be
    /// retried with [`reset_for_retry`](Self::reset_for_retry).
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState` if chunks are still missing
    /// - `Error::IntegrityMismatch` if the digest does not match
    pub fn assemble(&mut self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(Error::invalid_state("chunks still missing"));
        }

        let mut data = Vec::with_capacity(usize::try_from(self.offer.file_size).unwrap_or(0));
        for chunk in std::mem::take(&mut self.chunk_store).into_iter().flatten() {
            data.extend_from_slice(&chunk);
        }

        if let Some(expected) = &self.offer.hash {
            let actual = digest_hex(&data);
            if !actual.eq_ignore_ascii_case(expected) {
                self.state = TransferState::Failed;
                return Err(Error::IntegrityMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        self.state = TransferState::Completed;
        Ok(data)
    }

    /// Clear the store of a failed receive so every chunk can be requested
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless this is a failed receive.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.direction != Direction::Receive || self.state != TransferState::Failed {
            return Err(Error::invalid_state("only failed receives can be retried"));
        }
        self.chunk_store = empty_store(self.offer.total_chunks);
        self.received_count = 0;
        self.bytes_received = 0;
        self.receive_progress.reset();
        self.user_paused = false;
        self.state = TransferState::Accepted;
        Ok(())
    }

    // ============ Send side ============

    /// A pending peer accepted. Returns false if `peer` had no pending offer.
    pub fn on_accept(&mut self, peer: &PeerId) -> bool {
        if self.state.is_terminal() || !self.pending.remove(peer) {
            return false;
        }
        let state = if self.user_paused {
            StreamState::Paused
        } else {
            StreamState::Active
        };
        self.streams.insert(
            peer.clone(),
            SendStream {
                cursor: 0,
                resend: BTreeSet::new(),
                state,
                pump_active: false,
                bytes_sent: 0,
                chunks_sent: 0,
                progress: tracker(&self.config),
            },
        );
        self.refresh_send_state();
        true
    }

    /// A pending peer rejected. Returns false if `peer` had no pending offer.
    pub fn on_reject(&mut self, peer: &PeerId) -> bool {
        self.pending.remove(peer)
    }

    /// Replace `peer`'s plan with exactly `indices`.
    ///
    /// A request from a peer that never answered the offer counts as an
    /// accept. A finished stream is reopened; a completed transfer stays
    /// completed while the resend is served. Returns false if the request
    /// cannot be served.
    pub fn request_resend(&mut self, peer: &PeerId, indices: &[u64]) -> bool {
        if matches!(
            self.state,
            TransferState::Cancelled | TransferState::Failed
        ) {
            return false;
        }
        if self.pending.contains(peer) {
            self.on_accept(peer);
        }
        let total = self.offer.total_chunks;
        let user_paused = self.user_paused;
        let Some(stream) = self.streams.get_mut(peer) else {
            return false;
        };

        stream.resend = indices.iter().copied().filter(|i| *i < total).collect();
        stream.cursor = total;
        if stream.state == StreamState::Done {
            stream.state = if user_paused {
                StreamState::Paused
            } else {
                StreamState::Active
            };
        }
        self.refresh_send_state();
        true
    }

    /// Claim the pump for `peer`'s stream. Returns false if the stream is
    /// not active or a pump is already running.
    pub fn claim_pump(&mut self, peer: &PeerId) -> bool {
        match self.streams.get_mut(peer) {
            Some(stream) if stream.state == StreamState::Active && !stream.pump_active => {
                stream.pump_active = true;
                true
            }
            _ => false,
        }
    }

    /// Release the pump claim for `peer`
    pub fn release_pump(&mut self, peer: &PeerId) {
        if let Some(stream) = self.streams.get_mut(peer) {
            stream.pump_active = false;
        }
    }

    /// Decide the pump's next action. `Stop` releases the claim.
    pub fn pump_step(&mut self, peer: &PeerId) -> PumpStep {
        let stopped = matches!(
            self.state,
            TransferState::Cancelled | TransferState::Failed
        );
        let total = self.offer.total_chunks;
        let Some(stream) = self.streams.get_mut(peer) else {
            return PumpStep::Stop;
        };
        if stopped || stream.state != StreamState::Active {
            stream.pump_active = false;
            return PumpStep::Stop;
        }

        let index = match stream.resend.pop_first() {
            Some(index) => index,
            None if stream.cursor < total => {
                let index = stream.cursor;
                stream.cursor += 1;
                index
            }
            None => return PumpStep::Drained,
        };

        let chunk_size = self.offer.chunk_size;
        match expected_chunk_len(self.offer.file_size, chunk_size, index) {
            Some(len) => PumpStep::Send {
                index,
                offset: index * chunk_size as u64,
                len,
            },
            None => PumpStep::Drained,
        }
    }

    /// Record a chunk handed to the channel
    pub fn mark_sent(&mut self, peer: &PeerId, len: usize) {
        if let Some(stream) = self.streams.get_mut(peer) {
            stream.bytes_sent += len as u64;
            stream.chunks_sent += 1;
            stream.progress.record(len as u64);
        }
        if self.state == TransferState::Waiting {
            self.state = TransferState::Transferring;
        }
    }

    /// Put an unsent chunk back at the front of `peer`'s plan
    pub fn requeue(&mut self, peer: &PeerId, index: u64) {
        if let Some(stream) = self.streams.get_mut(peer) {
            stream.resend.insert(index);
        }
    }

    /// Finish `peer`'s stream if its plan is empty. Returns false if more
    /// work arrived meanwhile. Either way the pump claim is kept only when
    /// false is returned.
    pub fn finish_stream(&mut self, peer: &PeerId) -> bool {
        let total = self.offer.total_chunks;
        let Some(stream) = self.streams.get_mut(peer) else {
            return true;
        };
        if stream.has_work(total) && stream.state == StreamState::Active {
            return false;
        }
        if !stream.has_work(total) {
            stream.state = StreamState::Done;
        }
        stream.pump_active = false;
        true
    }

    /// Suspend `peer`'s stream. Returns true if it was active.
    pub fn pause_stream(&mut self, peer: &PeerId) -> bool {
        let paused = match self.streams.get_mut(peer) {
            Some(stream) if stream.state == StreamState::Active => {
                stream.state = StreamState::Paused;
                true
            }
            _ => false,
        };
        self.refresh_send_state();
        paused
    }

    /// Resume `peer`'s stream unless the user paused the transfer. Returns
    /// true if it was paused.
    pub fn resume_stream(&mut self, peer: &PeerId) -> bool {
        if self.user_paused
            || matches!(
                self.state,
                TransferState::Cancelled | TransferState::Failed
            )
        {
            return false;
        }
        let resumed = match self.streams.get_mut(peer) {
            Some(stream) if stream.state == StreamState::Paused => {
                stream.state = StreamState::Active;
                true
            }
            _ => false,
        };
        self.refresh_send_state();
        resumed
    }

    /// Forget `peer` entirely
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.pending.remove(peer);
        self.streams.remove(peer);
        self.refresh_send_state();
    }

    /// Settle a send transfer once nobody is left to serve.
    ///
    /// Returns the new terminal state if the transfer just finished:
    /// `Completed` when every accepting peer's stream is done, `Cancelled`
    /// when no peer accepted.
    pub fn evaluate_completion(&mut self) -> Option<TransferState> {
        if self.direction != Direction::Send
            || self.state.is_terminal()
            || !self.pending.is_empty()
        {
            return None;
        }
        if self.streams.is_empty() {
            self.state = TransferState::Cancelled;
            return Some(self.state);
        }
        if self
            .streams
            .values()
            .all(|stream| stream.state == StreamState::Done)
        {
            self.state = TransferState::Completed;
            return Some(self.state);
        }
        None
    }

    fn refresh_send_state(&mut self) {
        if self.direction != Direction::Send || self.state.is_terminal() {
            return;
        }
        let mut active = false;
        let mut paused = false;
        for stream in self.streams.values() {
            match stream.state {
                StreamState::Active => active = true,
                StreamState::Paused => paused = true,
                StreamState::Done => {}
            }
        }
        if active {
            self.state = TransferState::Transferring;
        } else if paused || self.user_paused {
            self.state = TransferState::Paused;
        }
    }

    // ============ Both directions ============

    /// User pause. Returns true if the state changed.
    pub fn pause(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.user_paused = true;
        match self.direction {
            Direction::Send => {
                for stream in self.streams.values_mut() {
                    if stream.state == StreamState::Active {
                        stream.state = StreamState::Paused;
                    }
                }
                let before = self.state;
                self.state = TransferState::Paused;
                before != TransferState::Paused
            }
            Direction::Receive => self.suspend(),
        }
    }

    /// Pause a receive transfer because its sender went away. Returns true
    /// if the state changed.
    pub fn suspend(&mut self) -> bool {
        if matches!(
            self.state,
            TransferState::Accepted | TransferState::Transferring
        ) {
            self.state = TransferState::Paused;
            true
        } else {
            false
        }
    }

    /// Clear a user pause. For a send transfer every paused stream becomes
    /// active; for a receive transfer the session leaves `Paused`. Returns
    /// true if the state changed.
    pub fn resume(&mut self) -> bool {
        self.user_paused = false;
        if self.state != TransferState::Paused {
            return false;
        }
        match self.direction {
            Direction::Send => {
                for stream in self.streams.values_mut() {
                    if stream.state == StreamState::Paused {
                        stream.state = StreamState::Active;
                    }
                }
                if self.streams.is_empty() {
                    self.state = TransferState::Waiting;
                }
                self.refresh_send_state();
            }
            Direction::Receive => {
                self.state = if self.received_count > 0 {
                    TransferState::Transferring
                } else {
                    TransferState::Accepted
                };
            }
        }
        self.state != TransferState::Paused
    }

    /// Cancel, releasing chunk storage. Returns false if already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TransferState::Cancelled;
        self.chunk_store = Vec::new();
        self.pending.clear();
        self.streams.clear();
        true
    }

    /// Mark failed, releasing chunk storage. Returns false if already
    /// terminal.
    pub fn fail(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TransferState::Failed;
        self.chunk_store = Vec::new();
        self.streams.clear();
        self.pending.clear();
        true
    }

    /// Bytes moved so far: received bytes, or `peer`'s sent bytes capped at
    /// the file size.
    #[must_use]
    pub fn bytes_done(&self, peer: &PeerId) -> u64 {
        match self.direction {
            Direction::Receive => self.bytes_received,
            Direction::Send => self
                .streams
                .get(peer)
                .map_or(0, |stream| stream.bytes_sent.min(self.offer.file_size)),
        }
    }

    /// Progress figures for `peer`'s stream (send) or the transfer
    /// (receive), if an update is due.
    pub fn progress_sample(&mut self, peer: &PeerId, force: bool) -> Option<ProgressSample> {
        let done = self.bytes_done(peer);
        let total = self.offer.file_size;
        match self.direction {
            Direction::Receive => self.receive_progress.sample(done, total, force),
            Direction::Send => self
                .streams
                .get_mut(peer)
                .and_then(|stream| stream.progress.sample(done, total, force)),
        }
    }
}

fn tracker(config: &TransferConfig) -> ProgressTracker {
    ProgressTracker::new(config.speed_window(), config.progress_interval())
}

fn empty_store(total_chunks: u64) -> Vec<Option<Vec<u8>>> {
    let mut store = Vec::new();
    store.resize_with(usize::try_from(total_chunks).unwrap_or(0), || None);
    store
}

/// Length of chunk `index` of a `file_size`-byte file, `None` if out of
/// range.
#[must_use]
pub fn expected_chunk_len(file_size: u64, chunk_size: usize, index: u64) -> Option<usize> {
    let chunk_size = chunk_size as u64;
    let offset = index.checked_mul(chunk_size)?;
    if offset >= file_size {
        return None;
    }
    Some((file_size - offset).min(chunk_size) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn offer(file_size: u64, chunk_size: usize, data: Option<&[u8]>) -> FileOffer {
        FileOffer {
            file_id: "f1".into(),
            file_name: "file.bin".into(),
            file_type: "application/octet-stream".into(),
            file_size,
            total_chunks: file_size.div_ceil(chunk_size as u64),
            chunk_size,
            hash: data.map(digest_hex),
            sender_id: PeerId::from("sender"),
        }
    }

    fn chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        data.chunks(chunk_size).map(<[u8]>::to_vec).collect()
    }

    fn receiving(data: &[u8], chunk_size: usize) -> TransferSession {
        let mut session = TransferSession::new_receive(
            offer(data.len() as u64, chunk_size, Some(data)),
            &TransferConfig::default(),
        );
        session.accept();
        session
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let mut session = receiving(&data, 16384);
        assert_eq!(session.total_chunks(), 7);
        assert_eq!(session.expected_chunk_len(6), Some(1696));

        let parts = chunks(&data, 16384);
        for (i, chunk) in parts.iter().enumerate().rev() {
            let outcome = session.store_chunk(i as u64, chunk.clone()).unwrap();
            assert_eq!(outcome, ChunkOutcome::Stored { complete: i == 0 });
        }

        assert_eq!(session.assemble().unwrap(), data);
        assert_eq!(session.state(), TransferState::Completed);
    }

    #[test]
    fn test_missing_chunks_after_partial_delivery() {
        let data = vec![1u8; 10 * 100];
        let mut session = receiving(&data, 100);
        for i in 0..3 {
            session.store_chunk(i, vec![1u8; 100]).unwrap();
        }
        assert_eq!(session.missing_chunks(), vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_rejects_wrong_length_and_range() {
        let data = vec![0u8; 250];
        let mut session = receiving(&data, 100);
        assert!(matches!(
            session.store_chunk(0, vec![0u8; 50]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            session.store_chunk(2, vec![0u8; 100]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            session.store_chunk(3, vec![0u8; 50]),
            Err(Error::Protocol(_))
        ));
        assert!(session.store_chunk(2, vec![0u8; 50]).is_ok());
    }

    #[test]
    fn test_chunks_refused_until_accepted_and_while_paused() {
        let data = vec![0u8; 200];
        let mut session = TransferSession::new_receive(
            offer(200, 100, Some(&data)),
            &TransferConfig::default(),
        );
        assert!(session.store_chunk(0, vec![0u8; 100]).is_err());

        session.accept();
        session.store_chunk(0, vec![0u8; 100]).unwrap();
        assert!(session.pause());
        assert!(session.store_chunk(1, vec![0u8; 100]).is_err());
        assert!(session.resume());
        assert_eq!(session.state(), TransferState::Transferring);
        assert_eq!(
            session.store_chunk(1, vec![0u8; 100]).unwrap(),
            ChunkOutcome::Stored { complete: true }
        );
    }

    #[test]
    fn test_integrity_mismatch_then_retry() {
        let data = vec![5u8; 300];
        let mut session = receiving(&data, 100);
        session.store_chunk(0, vec![5u8; 100]).unwrap();
        session.store_chunk(1, vec![6u8; 100]).unwrap();
        session.store_chunk(2, vec![5u8; 100]).unwrap();

        assert!(matches!(
            session.assemble(),
            Err(Error::IntegrityMismatch { .. })
        ));
        assert_eq!(session.state(), TransferState::Failed);

        session.reset_for_retry().unwrap();
        assert_eq!(session.state(), TransferState::Accepted);
        assert_eq!(session.missing_chunks(), vec![0, 1, 2]);
        for i in 0..3 {
            session.store_chunk(i, vec![5u8; 100]).unwrap();
        }
        assert_eq!(session.assemble().unwrap(), data);
    }

    #[test]
    fn test_empty_file_completes_without_chunks() {
        let mut session = receiving(&[], 16384);
        assert_eq!(session.total_chunks(), 0);
        assert!(session.is_complete());
        assert_eq!(session.assemble().unwrap(), Vec::<u8>::new());
    }

    fn sending(total_bytes: u64, chunk_size: usize, peers: &[&str]) -> TransferSession {
        TransferSession::new_send(
            offer(total_bytes, chunk_size, None),
            peers.iter().map(|p| PeerId::from(*p)),
            &TransferConfig::default(),
        )
    }

    fn drain(session: &mut TransferSession, peer: &PeerId) -> Vec<u64> {
        let mut sent = Vec::new();
        while let PumpStep::Send { index, len, .. } = session.pump_step(peer) {
            session.mark_sent(peer, len);
            sent.push(index);
        }
        sent
    }

    #[test]
    fn test_accept_then_reject_race() {
        let mut session = sending(1000, 100, &["a"]);
        let a = PeerId::from("a");

        assert!(session.on_accept(&a));
        assert_eq!(session.state(), TransferState::Transferring);
        assert!(!session.on_reject(&a));
        assert!(!session.on_accept(&a));
        assert_eq!(session.stream(&a).unwrap().state(), StreamState::Active);
    }

    #[test]
    fn test_independent_stream_positions() {
        let mut session = sending(500, 100, &["fast", "slow"]);
        let fast = PeerId::from("fast");
        let slow = PeerId::from("slow");
        session.on_accept(&fast);
        session.on_accept(&slow);

        assert_eq!(drain(&mut session, &fast), vec![0, 1, 2, 3, 4]);
        assert_eq!(session.stream(&slow).unwrap().cursor(), 0);
        assert!(session.finish_stream(&fast));
        assert_eq!(session.evaluate_completion(), None);

        assert_eq!(drain(&mut session, &slow).len(), 5);
        assert!(session.finish_stream(&slow));
        assert_eq!(
            session.evaluate_completion(),
            Some(TransferState::Completed)
        );
    }

    #[test]
    fn test_resend_request_overrides_cursor() {
        let mut session = sending(1000, 100, &["a"]);
        let a = PeerId::from("a");
        session.on_accept(&a);
        for _ in 0..4 {
            session.pump_step(&a);
        }

        assert!(session.request_resend(&a, &[7, 3, 42, 5]));
        assert_eq!(drain(&mut session, &a), vec![3, 5, 7]);
        assert!(session.finish_stream(&a));
        assert_eq!(
            session.evaluate_completion(),
            Some(TransferState::Completed)
        );

        // Late resend after completion reopens the stream only.
        assert!(session.request_resend(&a, &[9]));
        assert_eq!(session.state(), TransferState::Completed);
        assert!(session.claim_pump(&a));
        assert_eq!(drain(&mut session, &a), vec![9]);
    }

    #[test]
    fn test_resend_request_from_pending_peer_accepts() {
        let mut session = sending(300, 100, &["a"]);
        let a = PeerId::from("a");
        assert!(session.request_resend(&a, &[0, 1, 2]));
        assert!(!session.is_pending(&a));
        assert_eq!(drain(&mut session, &a), vec![0, 1, 2]);
    }

    #[test]
    fn test_pause_resume_and_requeue() {
        let mut session = sending(300, 100, &["a"]);
        let a = PeerId::from("a");
        session.on_accept(&a);
        assert!(session.claim_pump(&a));
        assert!(!session.claim_pump(&a));

        let PumpStep::Send { index, .. } = session.pump_step(&a) else {
            panic!("expected a chunk");
        };
        session.requeue(&a, index);
        assert!(session.pause_stream(&a));
        assert_eq!(session.state(), TransferState::Paused);
        assert_eq!(session.pump_step(&a), PumpStep::Stop);

        assert!(session.resume_stream(&a));
        assert!(session.claim_pump(&a));
        assert_eq!(drain(&mut session, &a), vec![0, 1, 2]);
    }

    #[test]
    fn test_user_pause_blocks_reconnect_resume() {
        let mut session = sending(300, 100, &["a"]);
        let a = PeerId::from("a");
        session.on_accept(&a);
        assert!(session.pause());
        assert!(!session.resume_stream(&a));
        assert!(session.resume());
        assert_eq!(session.stream(&a).unwrap().state(), StreamState::Active);
    }

    #[test]
    fn test_no_accepting_peer_cancels() {
        let mut session = sending(300, 100, &["a", "b"]);
        assert!(session.on_reject(&PeerId::from("a")));
        assert_eq!(session.evaluate_completion(), None);
        session.remove_peer(&PeerId::from("b"));
        assert_eq!(
            session.evaluate_completion(),
            Some(TransferState::Cancelled)
        );
    }

    #[test]
    fn test_cancel_releases_store() {
        let data = vec![0u8; 300];
        let mut session = receiving(&data, 100);
        session.store_chunk(0, vec![0u8; 100]).unwrap();
        assert!(session.cancel());
        assert_eq!(session.state(), TransferState::Cancelled);
        assert!(session.missing_chunks().is_empty());
        assert!(session.store_chunk(1, vec![0u8; 100]).is_err());
        assert!(!session.cancel());
    }

    proptest! {
        #[test]
        fn prop_duplicate_chunks_are_idempotent(
            len in 1usize..5_000,
            chunk_size in 1usize..700,
            deliveries in proptest::collection::vec(any::<prop::sample::Index>(), 1..80),
        ) {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let parts = chunks(&data, chunk_size);
            let mut session = receiving(&data, chunk_size);

            let mut seen = HashSet::new();
            for pick in deliveries {
                let i = pick.index(parts.len());
                let received_before = session.received_count();
                let outcome = session.store_chunk(i as u64, parts[i].clone()).unwrap();
                if seen.insert(i) {
                    let stored = matches!(outcome, ChunkOutcome::Stored { .. });
                    prop_assert!(stored, "first delivery of {} was {:?}", i, outcome);
                    prop_assert_eq!(session.received_count(), received_before + 1);
                } else {
                    prop_assert_eq!(outcome, ChunkOutcome::Duplicate);
                    prop_assert_eq!(session.received_count(), received_before);
                }
            }
        }

        #[test]
        fn prop_no_premature_completion(
            len in 1usize..5_000,
            chunk_size in 1usize..700,
            order in proptest::collection::vec(any::<prop::sample::Index>(), 0..40),
        ) {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let parts = chunks(&data, chunk_size);
            let mut session = receiving(&data, chunk_size);

            for pick in order {
                let i = pick.index(parts.len());
                if let Ok(ChunkOutcome::Stored { complete }) =
                    session.store_chunk(i as u64, parts[i].clone())
                {
                    prop_assert_eq!(complete, session.missing_chunks().is_empty());
                }
                if !session.missing_chunks().is_empty() {
                    prop_assert!(session.assemble().is_err());
                    prop_assert_ne!(session.state(), TransferState::Completed);
                }
            }

            if session.missing_chunks().is_empty() {
                prop_assert_eq!(session.assemble().unwrap(), data);
                prop_assert_eq!(session.state(), TransferState::Completed);
            }
        }

        #[test]
        fn prop_chunk_lengths_cover_file(
            file_size in 0u64..1_000_000,
            chunk_size in 1usize..70_000,
        ) {
            let total = file_size.div_ceil(chunk_size as u64);
            let mut covered = 0u64;
            for index in 0..total {
                let len = expected_chunk_len(file_size, chunk_size, index).unwrap();
                if index + 1 < total {
                    prop_assert_eq!(len, chunk_size);
                } else {
                    prop_assert_eq!(len as u64, file_size - index * chunk_size as u64);
                }
                covered += len as u64;
            }
            prop_assert_eq!(covered, file_size);
            prop_assert_eq!(expected_chunk_len(file_size, chunk_size, total), None);
        }
    }
}
