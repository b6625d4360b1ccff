//! Chunked bulk transfer.
//!
//! A blob is split into fixed-size [`ChunkEnvelope`]s on the sending side and
//! reassembled by a [`ChunkReceiver`] that tolerates duplicates and any
//! arrival order. The transfer layer is compression-agnostic: callers compress
//! before splitting and decompress after assembling.
//!
//! A receiver only ever hands out a blob once every index has arrived. An
//! abandoned transfer is dropped with its receiver and never applied.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tether_net::{Destination, Message, Outbox, Reliability, base64_bytes};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One fragment of a larger blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Position of this chunk, `< total_chunks`.
    pub chunk_index: u32,
    /// Number of chunks in the transfer.
    pub total_chunks: u32,
    /// Chunk bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Metadata message that precedes a chunked world transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// The blob is an existing saved world rather than a fresh one.
    pub is_loading_existing: bool,
    /// Human-readable label (world or save name).
    pub label: String,
    /// Size of the compressed blob in bytes.
    pub total_compressed_size: u64,
    /// Number of chunks that follow.
    pub chunk_count: u32,
    /// Replaces a running client's world in place.
    pub is_live_resync: bool,
}

/// Split `blob` into chunks of at most `chunk_size` bytes.
///
/// An empty blob yields a single empty chunk so the receiver still sees a
/// complete transfer.
pub fn split(blob: &[u8], chunk_size: usize) -> Result<Vec<ChunkEnvelope>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    if blob.is_empty() {
        return Ok(vec![ChunkEnvelope {
            chunk_index: 0,
            total_chunks: 1,
            data: Vec::new(),
        }]);
    }

    let total = blob.len().div_ceil(chunk_size);
    let total_chunks = u32::try_from(total).map_err(|_| ChunkError::TooManyChunks(total))?;
    Ok(blob
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, data)| ChunkEnvelope {
            chunk_index: i as u32,
            total_chunks,
            data: data.to_vec(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Most chunks a receiver accepts for one transfer unless told otherwise:
/// 256 MiB of 1 KiB chunks.
pub const MAX_TRANSFER_CHUNKS: usize = 256 * 1024;

/// Accumulates chunks of one transfer until every index is present.
#[derive(Debug)]
pub struct ChunkReceiver {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    max_chunks: usize,
}

impl Default for ChunkReceiver {
    fn default() -> Self {
        Self::with_max_chunks(MAX_TRANSFER_CHUNKS)
    }
}

impl ChunkReceiver {
    /// Empty receiver. The transfer size is learned from the first chunk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty receiver refusing transfers declaring more than `max_chunks`.
    pub fn with_max_chunks(max_chunks: usize) -> Self {
        Self {
            slots: Vec::new(),
            received: 0,
            max_chunks,
        }
    }

    /// Store a chunk. Returns `true` once every index in `[0, total_chunks)`
    /// has been received.
    ///
    /// Duplicates overwrite the slot and are not counted twice.
    pub fn accept(&mut self, envelope: ChunkEnvelope) -> Result<bool, ChunkError> {
        let total = envelope.total_chunks as usize;
        if total == 0 {
            return Err(ChunkError::EmptyTransfer);
        }
        if total > self.max_chunks {
            return Err(ChunkError::TransferTooLarge {
                declared: envelope.total_chunks,
                max: self.max_chunks,
            });
        }
        if self.slots.is_empty() {
            self.slots.resize(total, None);
        } else if self.slots.len() != total {
            return Err(ChunkError::TotalMismatch {
                expected: self.slots.len() as u32,
                got: envelope.total_chunks,
            });
        }

        let index = envelope.chunk_index as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            return Err(ChunkError::IndexOutOfRange {
                index: envelope.chunk_index,
                total: envelope.total_chunks,
            });
        };
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(envelope.data);
        Ok(self.is_complete())
    }

    /// Returns `true` when every chunk has been received.
    pub fn is_complete(&self) -> bool {
        !self.slots.is_empty() && self.received == self.slots.len()
    }

    /// `(received, total)` chunk counts. `total` is 0 before the first chunk.
    pub fn progress(&self) -> (usize, usize) {
        (self.received, self.slots.len())
    }

    /// Concatenate the chunks by ascending index.
    pub fn assemble(&self) -> Result<Vec<u8>, ChunkError> {
        if !self.is_complete() {
            return Err(ChunkError::Incomplete {
                received: self.received,
                total: self.slots.len(),
            });
        }
        let len = self.slots.iter().flatten().map(Vec::len).sum();
        let mut blob = Vec::with_capacity(len);
        for data in self.slots.iter().flatten() {
            blob.extend_from_slice(data);
        }
        Ok(blob)
    }

    /// Discard every received chunk.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.received = 0;
    }
}

// ---------------------------------------------------------------------------
// Rate-limited transmitter
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedTransfer {
    destination: Destination,
    messages: VecDeque<Message>,
}

/// Queue of pre-built transfer messages drained a few per tick.
#[derive(Debug, Default)]
pub struct BlobTransmitter {
    queue: VecDeque<QueuedTransfer>,
}

impl BlobTransmitter {
    /// Empty transmitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `messages` for `destination`, sent in order after earlier transfers.
    pub fn enqueue(&mut self, destination: Destination, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.queue.push_back(QueuedTransfer {
            destination,
            messages: messages.into(),
        });
    }

    /// Move up to `max_messages` queued messages into `outbox`. Returns the
    /// number moved.
    pub fn poll(&mut self, max_messages: usize, outbox: &mut Outbox) -> usize {
        let mut sent = 0;
        while sent < max_messages {
            let Some(transfer) = self.queue.front_mut() else {
                break;
            };
            match transfer.messages.pop_front() {
                Some(message) => {
                    outbox.push(transfer.destination, message, Reliability::ReliableOrdered);
                    sent += 1;
                }
                None => {
                    self.queue.pop_front();
                }
            }
        }
        if self.queue.front().is_some_and(|t| t.messages.is_empty()) {
            self.queue.pop_front();
        }
        sent
    }

    /// Returns `true` when nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages still queued.
    pub fn pending(&self) -> usize {
        self.queue.iter().map(|t| t.messages.len()).sum()
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors splitting or reassembling a chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Chunk size must be positive.
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    /// The blob would need more chunks than the wire format can count.
    #[error("blob needs {0} chunks, more than a transfer can carry")]
    TooManyChunks(usize),
    /// A chunk declared more chunks than the receiver accepts.
    #[error("chunk declares {declared} total chunks, receiver accepts at most {max}")]
    TransferTooLarge {
        /// Total on the chunk.
        declared: u32,
        /// Receiver limit.
        max: usize,
    },
    /// A chunk declared a transfer of zero chunks.
    #[error("chunk declares an empty transfer")]
    EmptyTransfer,
    /// A chunk's index is not below its declared total.
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Declared total.
        total: u32,
    },
    /// A chunk disagrees with earlier chunks about the transfer size.
    #[error("chunk declares {got} total chunks, transfer has {expected}")]
    TotalMismatch {
        /// Total from the first chunk.
        expected: u32,
        /// Total on this chunk.
        got: u32,
    },
    /// Assembly was requested before every chunk arrived.
    #[error("transfer incomplete: {received} of {total} chunks")]
    Incomplete {
        /// Chunks received.
        received: usize,
        /// Chunks expected.
        total: usize,
    },
}
