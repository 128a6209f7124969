//! Resumable chunked file transfers.

mod manager;
mod session;
mod source;
mod speed;

pub use manager::{TransferManager, TransferSnapshot};
pub use session::{
    ChunkOutcome, Direction, PumpStep, SendStream, StreamState, TransferSession, TransferState,
    expected_chunk_len,
};
pub use source::{ChunkSource, FileSource, MemorySource, digest_source};
pub use speed::{
    ProgressGate, ProgressSample, ProgressTracker, SpeedMeter, format_eta, format_speed, percent,
};
