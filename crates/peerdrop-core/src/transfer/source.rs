//! Chunk sources for outbound transfers.
//!
//! Chunks are read on demand at `index * chunk_size`, so a file-backed
//! transfer never holds more than one chunk per stream in memory.

use crate::error::{Error, Result};
use async_trait::async_trait;
use peerdrop_crypto::ContentHasher;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Mutex;

/// Random-access byte source for an outbound transfer.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes
    fn len(&self) -> u64;

    /// Whether the source is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the range is out of bounds or the read fails.
    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// Source backed by an in-memory buffer
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    /// Wrap a buffer
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::Io(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::Io(format!("range {offset}+{len} out of bounds")))?;
        Ok(self.data[start..end].to_vec())
    }
}

/// Source reading from a file on disk through `tokio::fs`.
pub struct FileSource {
    path: PathBuf,
    len: u64,
    file: Mutex<File>,
}

impl FileSource {
    /// Open `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be opened or stat'ed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            len,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, for offers
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.len {
            return Err(Error::Io(format!(
                "range {offset}+{len} beyond end of {}",
                self.path.display()
            )));
        }
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

/// Stream a source through BLAKE3, one chunk at a time.
///
/// # Errors
///
/// Propagates read errors from the source.
pub async fn digest_source(source: &dyn ChunkSource, chunk_size: usize) -> Result<String> {
    let mut hasher = ContentHasher::new();
    let total = source.len();
    let mut offset = 0u64;
    while offset < total {
        let len = (total - offset).min(chunk_size as u64) as usize;
        let chunk = source.read_chunk(offset, len).await?;
        hasher.update(&chunk);
        offset += len as u64;
    }
    Ok(hasher.finalize_hex())
}
