//! Durable chunk stores
//!
//! Append-only keyed record sets of `{index, chunk, timestamp}`, cleared at
//! the start of every recording.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{CaptureError, Result};

/// Log file name inside the store directory
pub const LOG_FILE_NAME: &str = "chunks.log";

const FRAME_HEADER_LEN: usize = 8 + 8 + 4 + 4;

/// One captured chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Position among persisted chunks, from 0
    pub index: u64,
    pub bytes: Bytes,
    /// Monotonic capture timestamp in milliseconds
    pub timestamp: u64,
}

impl ChunkRecord {
    pub fn new(index: u64, bytes: Bytes, timestamp: u64) -> Self {
        Self {
            index,
            bytes,
            timestamp,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Durable storage for captured chunks
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Drop every record
    async fn clear(&self) -> Result<()>;

    /// Durably append one record
    async fn append(&self, record: &ChunkRecord) -> Result<()>;

    /// Every record, in append order
    async fn read_all(&self) -> Result<Vec<ChunkRecord>>;

    /// Number of records
    async fn len(&self) -> Result<u64>;

    /// Flush and release the store
    async fn close(&self) -> Result<()>;
}

/// In-process store
#[derive(Default)]
pub struct MemoryChunkStore {
    records: Mutex<Vec<ChunkRecord>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payload bytes held
    pub fn total_bytes(&self) -> u64 {
        self.records.lock().iter().map(|r| r.size() as u64).sum()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }

    async fn append(&self, record: &ChunkRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<ChunkRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.records.lock().len() as u64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Append-only framed log on disk.
///
/// Frame layout (little endian): index u64, timestamp u64, payload length
/// u32, CRC32C of payload u32, payload.
///
/// A frame only counts once it is fully written and synced. A failed append
/// truncates the log back to the last committed frame, and `open` drops a
/// torn frame left at the tail by a crash.
pub struct FileChunkStore {
    path: PathBuf,
    log: tokio::sync::Mutex<Option<LogFile>>,
}

struct LogFile {
    file: File,
    /// Length of the log up to the end of the last complete frame
    committed: u64,
    records: u64,
    /// Cut the next frame short after this many bytes
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl LogFile {
    fn new(file: File, committed: u64, records: u64) -> Self {
        Self {
            file,
            committed,
            records,
            #[cfg(test)]
            fail_after: None,
        }
    }

    /// Write and sync one frame
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())]).await?;
            self.file.flush().await?;
            return Err(std::io::Error::other("injected write failure"));
        }
        self.file.write_all(frame).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

/// Where decoding a log stopped early
enum DecodeStop {
    /// The tail frame is incomplete
    Torn { offset: u64, reason: String },
    /// A complete frame failed its checksum
    Corrupt { offset: u64, reason: String },
}

impl DecodeStop {
    fn into_error(self) -> CaptureError {
        match self {
            DecodeStop::Torn { offset, reason } | DecodeStop::Corrupt { offset, reason } => {
                CaptureError::StoreCorrupted { offset, reason }
            }
        }
    }
}

impl FileChunkStore {
    /// Open (or create) the log inside `dir`, dropping a torn tail frame
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let data = Bytes::from(tokio::fs::read(&path).await?);
        let (records, stop) = Self::decode_prefix(data.clone());
        let committed = match stop {
            Some(DecodeStop::Torn { offset, reason }) => {
                warn!(
                    "Dropping torn tail of {} at offset {}: {}",
                    path.display(),
                    offset,
                    reason
                );
                file.set_len(offset).await?;
                file.sync_all().await?;
                offset
            }
            // left in place so read_all keeps reporting it
            Some(DecodeStop::Corrupt { .. }) | None => data.len() as u64,
        };

        debug!(
            "Opened chunk store at {} ({} records)",
            path.display(),
            records.len()
        );
        Ok(Self {
            path,
            log: tokio::sync::Mutex::new(Some(LogFile::new(
                file,
                committed,
                records.len() as u64,
            ))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(record: &ChunkRecord) -> Result<Bytes> {
        let len = u32::try_from(record.bytes.len()).map_err(|_| CaptureError::StoreWrite {
            index: record.index,
            message: format!("chunk of {} bytes exceeds frame limit", record.bytes.len()),
        })?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + record.bytes.len());
        frame.put_u64_le(record.index);
        frame.put_u64_le(record.timestamp);
        frame.put_u32_le(len);
        frame.put_u32_le(crc32c::crc32c(&record.bytes));
        frame.put_slice(&record.bytes);
        Ok(frame.freeze())
    }

    fn decode(data: Bytes) -> Result<Vec<ChunkRecord>> {
        match Self::decode_prefix(data) {
            (records, None) => Ok(records),
            (_, Some(stop)) => Err(stop.into_error()),
        }
    }

    /// Decode frames up to the first bad one
    fn decode_prefix(data: Bytes) -> (Vec<ChunkRecord>, Option<DecodeStop>) {
        let mut records = Vec::new();
        let mut cursor = data;
        let mut offset = 0u64;

        while cursor.has_remaining() {
            if cursor.remaining() < FRAME_HEADER_LEN {
                let stop = DecodeStop::Torn {
                    offset,
                    reason: "truncated frame header".into(),
                };
                return (records, Some(stop));
            }
            let index = cursor.get_u64_le();
            let timestamp = cursor.get_u64_le();
            let len = cursor.get_u32_le() as usize;
            let expected = cursor.get_u32_le();
            if cursor.remaining() < len {
                let stop = DecodeStop::Torn {
                    offset,
                    reason: format!(
                        "frame {} truncated: {} of {} bytes",
                        index,
                        cursor.remaining(),
                        len
                    ),
                };
                return (records, Some(stop));
            }
            let bytes = cursor.split_to(len);
            let actual = crc32c::crc32c(&bytes);
            if actual != expected {
                let stop = DecodeStop::Corrupt {
                    offset,
                    reason: format!(
                        "checksum mismatch for frame {}: expected {}, got {}",
                        index, expected, actual
                    ),
                };
                return (records, Some(stop));
            }
            offset += (FRAME_HEADER_LEN + len) as u64;
            records.push(ChunkRecord::new(index, bytes, timestamp));
        }

        (records, None)
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn clear(&self) -> Result<()> {
        let mut guard = self.log.lock().await;
        let log = guard.as_mut().ok_or_else(closed_error)?;
        log.file.set_len(0).await?;
        log.file.sync_all().await?;
        log.committed = 0;
        log.records = 0;
        debug!("Cleared chunk store {}", self.path.display());
        Ok(())
    }

    async fn append(&self, record: &ChunkRecord) -> Result<()> {
        let frame = Self::encode(record)?;
        let mut guard = self.log.lock().await;
        let log = guard.as_mut().ok_or_else(closed_error)?;

        if let Err(e) = log.write_frame(&frame).await {
            // keep earlier frames readable after a partial write
            if let Err(trunc) = log.file.set_len(log.committed).await {
                warn!(
                    "Could not roll back {} to {} bytes: {}",
                    self.path.display(),
                    log.committed,
                    trunc
                );
            }
            return Err(CaptureError::StoreWrite {
                index: record.index,
                message: e.to_string(),
            });
        }

        log.committed += frame.len() as u64;
        log.records += 1;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<ChunkRecord>> {
        let _guard = self.log.lock().await;
        let data = tokio::fs::read(&self.path).await?;
        Self::decode(Bytes::from(data))
    }

    async fn len(&self) -> Result<u64> {
        let guard = self.log.lock().await;
        let log = guard.as_ref().ok_or_else(closed_error)?;
        Ok(log.records)
    }

    async fn close(&self) -> Result<()> {
        if let Some(log) = self.log.lock().await.take() {
            log.file.sync_all().await?;
            debug!("Closed chunk store {}", self.path.display());
        }
        Ok(())
    }
}

fn closed_error() -> CaptureError {
    CaptureError::StoreWrite {
        index: 0,
        message: "chunk store is closed".into(),
    }
}
