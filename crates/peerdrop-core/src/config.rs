//! Session and transfer configuration
//!
//! All options have defaults, so a TOML file only needs to name the values it
//! changes:
//!
//! ```toml
//! [peer]
//! connection_timeout_ms = 30000
//! encryption = true
//!
//! [transfer]
//! chunk_size = 16384
//! max_concurrent_transfers = 3
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Peer session configuration
    pub peer: PeerConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

impl Config {
    /// Validate option combinations.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        self.peer.validate()?;
        self.transfer.validate()
    }
}

/// Peer session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PeerConfig {
    /// Time allowed from `Connecting` to `Connected`
    pub connection_timeout_ms: u64,

    /// Time allowed for a liveness probe round trip
    pub probe_timeout_ms: u64,

    /// Keepalive send interval while connected
    pub keepalive_interval_ms: u64,

    /// Consecutive missed keepalives that force a disconnect
    pub max_missed_keepalive: u32,

    /// Base delay for reconnect backoff
    pub reconnect_base_delay_ms: u64,

    /// Cap on a single reconnect delay
    pub reconnect_max_delay_ms: u64,

    /// Automatic reconnect attempts before `Failed`
    pub max_reconnect_attempts: u32,

    /// Add up to 25% random jitter to reconnect delays
    pub reconnect_jitter: bool,

    /// Exchange public keys and encrypt every message after the key exchange
    pub encryption: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 20_000,
            probe_timeout_ms: 5_000,
            keepalive_interval_ms: 4_000,
            max_missed_keepalive: 3,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 10_000,
            max_reconnect_attempts: 3,
            reconnect_jitter: true,
            encryption: true,
        }
    }
}

impl PeerConfig {
    /// Connection-establishment timeout
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Liveness probe timeout
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Keepalive interval
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.connection_timeout_ms == 0 {
            return Err(Error::invalid_config("connection_timeout_ms must be > 0"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::invalid_config("probe_timeout_ms must be > 0"));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(Error::invalid_config("keepalive_interval_ms must be > 0"));
        }
        if self.max_missed_keepalive == 0 {
            return Err(Error::invalid_config("max_missed_keepalive must be > 0"));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(Error::invalid_config(
                "reconnect_base_delay_ms must not exceed reconnect_max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for new outbound transfers
    pub chunk_size: usize,

    /// Largest file accepted for sending or receiving
    pub max_file_size: u64,

    /// Non-terminal transfers allowed at once (both directions)
    pub max_concurrent_transfers: usize,

    /// Buffered outbound bytes above which chunk sending pauses
    pub backpressure_high_water_bytes: usize,

    /// Minimum spacing of progress events for one transfer
    pub progress_interval_ms: u64,

    /// Sliding window for throughput measurement
    pub speed_window_ms: u64,

    /// Compute and verify a whole-file BLAKE3 digest
    pub compute_digest: bool,

    /// Most chunks an incoming offer may declare. Bounds the per-chunk
    /// bookkeeping a remote sender can make us allocate.
    pub max_offer_chunks: u64,

    /// How long a finished transfer (and the source of a completed send)
    /// is kept for late resend requests and status queries
    pub finished_retention_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_file_size: 2 * 1024 * 1024 * 1024,   // 2 GB
            max_concurrent_transfers: 3,
            backpressure_high_water_bytes: 1024 * 1024, // 1 MB
            progress_interval_ms: 250,
            speed_window_ms: 2_000,
            compute_digest: true,
            max_offer_chunks: 1 << 20,
            finished_retention_ms: 60_000,
        }
    }
}

impl TransferConfig {
    /// Progress event spacing
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Throughput window
    #[must_use]
    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }

    /// Retention of finished transfers
    #[must_use]
    pub fn finished_retention(&self) -> Duration {
        Duration::from_millis(self.finished_retention_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::invalid_config("chunk_size must be > 0"));
        }
        if self.chunk_size > self.backpressure_high_water_bytes {
            return Err(Error::invalid_config(
                "chunk_size must not exceed backpressure_high_water_bytes",
            ));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(Error::invalid_config("max_concurrent_transfers must be > 0"));
        }
        if self.speed_window_ms == 0 {
            return Err(Error::invalid_config("speed_window_ms must be > 0"));
        }
        if self.max_offer_chunks == 0 {
            return Err(Error::invalid_config("max_offer_chunks must be > 0"));
        }
        Ok(())
    }
}
