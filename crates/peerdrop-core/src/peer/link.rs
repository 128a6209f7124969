//! Send side of an established peer channel.
//!
//! A [`PeerLink`] is created when a channel opens and handed to the transfer
//! layer once the session reaches `Connected`. It owns three things the
//! channel itself does not know about:
//!
//! - the envelope cipher, installed once the key exchange completes
//! - a send lock that keeps a `chunk` metadata frame adjacent to its binary
//!   payload frame
//! - backpressure: chunk sends wait while the channel's buffered amount is
//!   above the high-water mark
//!
//! ```text
//!   pump A --+                        +--> Text(chunk meta) + Binary(bytes)
//!   pump B --+--> send_lock --> [buffered <= high water?] --> channel.send
//!   control -+        ^                   |
//!                     +---- drained <-----+ BufferedAmountLow
//! ```

use crate::error::{Error, Result};
use crate::protocol::{ControlMessage, WireMessage};
use peerdrop_crypto::EnvelopeCipher;
use peerdrop_discovery::PeerId;
use peerdrop_transport::{Channel, ChannelState, Frame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Fallback poll interval while waiting for the channel to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How chunk payloads are framed on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoding {
    /// `chunk` metadata text frame followed by one binary frame
    Paired,
    /// One enveloped `file-chunk` message with the bytes embedded
    Embedded,
}

struct LinkInner {
    peer: PeerId,
    channel: Arc<dyn Channel>,
    cipher: OnceLock<EnvelopeCipher>,
    high_water: usize,
    drained: Notify,
    closed: AtomicBool,
    send_lock: Mutex<()>,
}

/// Cloneable send handle for one channel to one peer.
#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    /// Wrap an opened (or opening) channel. Sets the channel's low-buffer
    /// threshold to `high_water`.
    #[must_use]
    pub fn new(peer: PeerId, channel: Arc<dyn Channel>, high_water: usize) -> Self {
        channel.set_buffered_amount_low_threshold(high_water);
        Self {
            inner: Arc::new(LinkInner {
                peer,
                channel,
                cipher: OnceLock::new(),
                high_water,
                drained: Notify::new(),
                closed: AtomicBool::new(false),
                send_lock: Mutex::new(()),
            }),
        }
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    /// Install the envelope cipher. Returns false if one was already set.
    pub fn install_cipher(&self, cipher: EnvelopeCipher) -> bool {
        self.inner.cipher.set(cipher).is_ok()
    }

    /// Envelope cipher, once the key exchange completed
    #[must_use]
    pub fn cipher(&self) -> Option<&EnvelopeCipher> {
        self.inner.cipher.get()
    }

    /// Chunk framing used on this link
    #[must_use]
    pub fn encoding(&self) -> ChunkEncoding {
        if self.cipher().is_some() {
            ChunkEncoding::Embedded
        } else {
            ChunkEncoding::Paired
        }
    }

    /// Whether this link can no longer carry traffic
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
            || self.inner.channel.state() == ChannelState::Closed
    }

    /// Retire the link; pending and future sends fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.drained.notify_waiters();
    }

    /// Whether two handles refer to the same link
    #[must_use]
    pub fn same_link(&self, other: &PeerLink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wake senders waiting for the channel to drain
    pub(crate) fn notify_drained(&self) {
        self.inner.drained.notify_waiters();
    }

    /// Outbound bytes buffered in the channel
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.inner.channel.buffered_amount()
    }

    /// Backpressure threshold
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.inner.high_water
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::channel_closed("link retired"));
        }
        Ok(())
    }

    /// Send a control message, sealed when a cipher is installed.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelClosed` for a retired link and
    /// `Error::Transport` if the channel rejects the frame.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let text = WireMessage::encode(message, self.cipher())?;
        let _guard = self.inner.send_lock.lock().await;
        self.ensure_open()?;
        self.inner.channel.send(Frame::Text(text)).await?;
        Ok(())
    }

    /// Send one chunk, waiting while the channel is above the high-water
    /// mark.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelClosed` if the link is retired while waiting
    /// and `Error::Transport` if the channel rejects a frame.
    pub async fn send_chunk(
        &self,
        file_id: &str,
        chunk_index: u64,
        total_chunks: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        let mut data = Some(data);
        loop {
            let notified = self.inner.drained.notified();
            {
                let _guard = self.inner.send_lock.lock().await;
                self.ensure_open()?;

                if self.buffered_amount() <= self.inner.high_water {
                    let Some(data) = data.take() else {
                        return Err(Error::invalid_state("chunk payload already consumed"));
                    };
                    return self
                        .write_chunk(file_id.to_owned(), chunk_index, total_chunks, data)
                        .await;
                }
            }

            tracing::trace!(
                peer = %self.inner.peer,
                buffered = self.buffered_amount(),
                high_water = self.inner.high_water,
                "Backpressure: waiting for channel to drain"
            );
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }

    async fn write_chunk(
        &self,
        file_id: String,
        chunk_index: u64,
        total_chunks: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        let channel = &self.inner.channel;
        match self.encoding() {
            ChunkEncoding::Embedded => {
                let message = ControlMessage::FileChunk {
                    file_id,
                    chunk_index,
                    total_chunks,
                    data,
                };
                let text = WireMessage::encode(&message, self.cipher())?;
                channel.send(Frame::Text(text)).await?;
            }
            ChunkEncoding::Paired => {
                let meta = ControlMessage::Chunk {
                    file_id,
                    chunk_index,
                    total_chunks,
                };
                let text = WireMessage::encode(&meta, None)?;
                channel.send(Frame::Text(text)).await?;
                channel.send(Frame::Binary(data)).await?;
            }
        }
        Ok(())
    }

    /// Wait until everything queued on the channel has left the buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelClosed` if the link closes first.
    pub async fn flush(&self) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(Error::channel_closed("link closed before flush"));
            }
            if self.buffered_amount() == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.inner.peer)
            .field("encrypted", &self.cipher().is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
