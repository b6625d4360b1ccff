//! Full-state ("hard") synchronization.
//!
//! The host serializes its whole world, compresses it, hashes the compressed
//! blob (SHA-256, base64) and queues a metadata message followed by the
//! chunks. Transmission is rate-limited, so a hard sync stays in
//! [`HardSyncPhase::Transmitting`] across several engine ticks; a trigger
//! arriving in any non-idle phase is dropped.
//!
//! The client reassembles the blob and checks the hash before it decompresses
//! anything. A mismatch leaves the current world untouched.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tether_net::{
    DecodeError, Destination, EncodeError, MAX_DECOMPRESSED_LEN, Message, MessageKind, Outbox,
    SessionContext, compress, decompress,
};

use crate::chunk_transfer::{
    BlobTransmitter, ChunkEnvelope, ChunkError, ChunkReceiver, MAX_TRANSFER_CHUNKS,
    TransferMetadata, split,
};

/// File a received snapshot is written to before loading. Each apply
/// replaces the previous one.
pub const SNAPSHOT_FILE_NAME: &str = "hard_sync.bin";

/// Why a hard sync was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardSyncReason {
    /// The simulation crossed a hard-sync interval boundary.
    Periodic,
    /// Requested by the hosting application.
    Manual,
    /// Too many consecutive checksum mismatches.
    DriftBudgetExceeded,
    /// Initial world transfer to a (late) joiner.
    InitialLoad,
}

impl HardSyncReason {
    /// Initial loads go to clients that have no world yet.
    pub fn is_live(self) -> bool {
        self != Self::InitialLoad
    }
}

/// Host-side hard-sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardSyncPhase {
    /// No hard sync in flight.
    Idle,
    /// Serializing the world.
    Serializing,
    /// Compressing and hashing the blob.
    Compressing,
    /// Chunks are queued for transmission.
    Transmitting,
}

/// Hard-sync part of the announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardSyncMetadata {
    /// Why the host started the sync.
    pub reason: HardSyncReason,
    /// Host simulation tick the snapshot was taken at.
    pub tick: i64,
    /// Base64 SHA-256 of the compressed blob.
    pub data_hash: String,
}

/// Payload of `WorldData` / `ResyncWorldData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardSyncAnnouncement {
    /// Transfer description.
    pub transfer: TransferMetadata,
    /// Snapshot description.
    pub sync: HardSyncMetadata,
}

/// A compressed, hashed world snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardSyncSnapshot {
    /// Why it was taken.
    pub reason: HardSyncReason,
    /// Compressed serialized world.
    pub compressed_blob: Vec<u8>,
    /// Base64 SHA-256 of `compressed_blob` as announced.
    pub hash: String,
    /// Host tick the snapshot was taken at.
    pub simulated_tick: i64,
}

impl HardSyncSnapshot {
    /// Compress and hash a serialized world.
    pub fn build(reason: HardSyncReason, simulated_tick: i64, raw: &[u8]) -> Self {
        let compressed_blob = compress(raw);
        let hash = content_hash(&compressed_blob);
        Self {
            reason,
            compressed_blob,
            hash,
            simulated_tick,
        }
    }

    /// Check the blob against its announced hash.
    pub fn verify(&self) -> Result<(), HardSyncError> {
        let actual = content_hash(&self.compressed_blob);
        if actual != self.hash {
            return Err(HardSyncError::HashMismatch {
                expected: self.hash.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Base64 of the SHA-256 digest of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    STANDARD.encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Builds and transmits hard syncs, one at a time.
#[derive(Debug)]
pub struct HardSyncManager {
    phase: HardSyncPhase,
    chunk_size: usize,
    interval_ticks: u64,
    last_period: i64,
    transmitter: BlobTransmitter,
    completed: u64,
}

impl HardSyncManager {
    /// `interval_ticks == 0` disables periodic hard syncs.
    pub fn new(chunk_size: usize, interval_ticks: u64) -> Self {
        Self {
            phase: HardSyncPhase::Idle,
            chunk_size,
            interval_ticks,
            last_period: 0,
            transmitter: BlobTransmitter::new(),
            completed: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HardSyncPhase {
        self.phase
    }

    /// Returns `true` while a hard sync is being built or transmitted.
    pub fn in_flight(&self) -> bool {
        self.phase != HardSyncPhase::Idle
    }

    /// Hard syncs fully handed to the outbox so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Returns `true` once each time `tick` enters a new multiple of the
    /// hard-sync interval.
    pub fn periodic_due(&mut self, tick: i64) -> bool {
        if self.interval_ticks == 0 || tick <= 0 {
            return false;
        }
        let period = tick / self.interval_ticks as i64;
        if period > self.last_period {
            self.last_period = period;
            return true;
        }
        false
    }

    /// Start a hard sync to `destination`.
    ///
    /// Returns `Ok(false)` if one is already in flight; the trigger is
    /// dropped, not queued. A serialization failure returns to
    /// [`HardSyncPhase::Idle`] without sending anything.
    pub fn trigger(
        &mut self,
        ctx: &SessionContext,
        reason: HardSyncReason,
        tick: i64,
        destination: Destination,
        serialize: impl FnOnce() -> Result<Vec<u8>, String>,
    ) -> Result<bool, HardSyncError> {
        if !ctx.is_host() {
            return Err(HardSyncError::NotHost);
        }
        if self.in_flight() {
            tracing::info!(?reason, phase = ?self.phase, "hard sync already in flight, dropping trigger");
            return Ok(false);
        }

        self.phase = HardSyncPhase::Serializing;
        let raw = match serialize() {
            Ok(raw) => raw,
            Err(e) => {
                self.phase = HardSyncPhase::Idle;
                tracing::error!(?reason, tick, "hard sync aborted, world serialization failed: {e}");
                return Err(HardSyncError::Serialize(e));
            }
        };

        self.phase = HardSyncPhase::Compressing;
        let snapshot = HardSyncSnapshot::build(reason, tick, &raw);
        let messages = match self.build_messages(ctx, &snapshot) {
            Ok(messages) => messages,
            Err(e) => {
                self.phase = HardSyncPhase::Idle;
                tracing::error!(?reason, tick, "hard sync aborted: {e}");
                return Err(e);
            }
        };

        tracing::info!(
            ?reason,
            tick,
            raw_bytes = raw.len(),
            compressed_bytes = snapshot.compressed_blob.len(),
            chunks = messages.len() - 1,
            ?destination,
            "hard sync started"
        );
        self.transmitter.enqueue(destination, messages);
        self.phase = HardSyncPhase::Transmitting;
        Ok(true)
    }

    fn build_messages(
        &self,
        ctx: &SessionContext,
        snapshot: &HardSyncSnapshot,
    ) -> Result<Vec<Message>, HardSyncError> {
        let chunks = split(&snapshot.compressed_blob, self.chunk_size)?;
        let announcement = HardSyncAnnouncement {
            transfer: TransferMetadata {
                is_loading_existing: true,
                label: format!("{:?}", snapshot.reason),
                total_compressed_size: snapshot.compressed_blob.len() as u64,
                chunk_count: chunks.len() as u32,
                is_live_resync: snapshot.reason.is_live(),
            },
            sync: HardSyncMetadata {
                reason: snapshot.reason,
                tick: snapshot.simulated_tick,
                data_hash: snapshot.hash.clone(),
            },
        };
        let kind = if snapshot.reason.is_live() {
            MessageKind::ResyncWorldData
        } else {
            MessageKind::WorldData
        };

        let mut messages = Vec::with_capacity(chunks.len() + 1);
        messages.push(Message::with_payload(
            kind,
            ctx.local_id,
            snapshot.simulated_tick,
            &announcement,
        )?);
        for chunk in &chunks {
            messages.push(Message::with_payload(
                MessageKind::WorldDataChunk,
                ctx.local_id,
                snapshot.simulated_tick,
                chunk,
            )?);
        }
        Ok(messages)
    }

    /// Move up to `max_messages` queued transfer messages into `outbox`,
    /// returning to idle once the queue drains.
    pub fn poll_transmit(&mut self, max_messages: usize, outbox: &mut Outbox) -> usize {
        if self.phase != HardSyncPhase::Transmitting {
            return 0;
        }
        let sent = self.transmitter.poll(max_messages, outbox);
        if self.transmitter.is_idle() {
            self.phase = HardSyncPhase::Idle;
            self.completed += 1;
            tracing::info!("hard sync transmission complete");
        }
        sent
    }

    /// Drop any in-flight transfer and restart the periodic schedule
    /// (session reset).
    pub fn abort(&mut self) {
        if self.in_flight() {
            tracing::warn!(pending = self.transmitter.pending(), "hard sync abandoned");
        }
        self.transmitter.clear();
        self.phase = HardSyncPhase::Idle;
        self.last_period = 0;
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct IncomingSnapshot {
    announcement: HardSyncAnnouncement,
    chunks: ChunkReceiver,
}

/// A fully reassembled, not yet verified snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedHardSync {
    /// The snapshot as announced.
    pub snapshot: HardSyncSnapshot,
    /// Transfer description from the announcement.
    pub transfer: TransferMetadata,
}

/// Reassembles, verifies, and applies hard syncs.
#[derive(Debug)]
pub struct HardSyncReceiver {
    snapshot_dir: PathBuf,
    incoming: Option<IncomingSnapshot>,
}

impl HardSyncReceiver {
    /// Received blobs are written under `snapshot_dir` before loading.
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            incoming: None,
        }
    }

    /// Start a transfer from a `WorldData` / `ResyncWorldData` message.
    /// Any transfer still in progress is abandoned.
    pub fn handle_announcement(
        &mut self,
        message: &Message,
    ) -> Result<HardSyncAnnouncement, HardSyncError> {
        let announcement: HardSyncAnnouncement = message.payload_as()?;
        if self.incoming.is_some() {
            tracing::warn!("new hard sync announced, abandoning incomplete transfer");
            self.incoming = None;
        }
        let transfer = &announcement.transfer;
        let chunk_count = transfer.chunk_count as usize;
        if chunk_count == 0 {
            return Err(ChunkError::EmptyTransfer.into());
        }
        if chunk_count > MAX_TRANSFER_CHUNKS {
            return Err(ChunkError::TransferTooLarge {
                declared: transfer.chunk_count,
                max: MAX_TRANSFER_CHUNKS,
            }
            .into());
        }
        if transfer.total_compressed_size > MAX_DECOMPRESSED_LEN as u64 {
            return Err(HardSyncError::TooLarge(transfer.total_compressed_size));
        }
        tracing::info!(
            reason = ?announcement.sync.reason,
            tick = announcement.sync.tick,
            bytes = announcement.transfer.total_compressed_size,
            chunks = announcement.transfer.chunk_count,
            live = announcement.transfer.is_live_resync,
            "hard sync incoming"
        );
        self.incoming = Some(IncomingSnapshot {
            announcement: announcement.clone(),
            chunks: ChunkReceiver::with_max_chunks(chunk_count),
        });
        Ok(announcement)
    }

    /// Accept a `WorldDataChunk`. Returns the reassembled snapshot once
    /// every chunk has arrived.
    pub fn handle_chunk(
        &mut self,
        message: &Message,
    ) -> Result<Option<ReceivedHardSync>, HardSyncError> {
        let envelope: ChunkEnvelope = message.payload_as()?;
        let Some(incoming) = self.incoming.as_mut() else {
            return Err(HardSyncError::NoTransfer);
        };
        let expected = incoming.announcement.transfer.chunk_count;
        if envelope.total_chunks != expected {
            self.incoming = None;
            return Err(HardSyncError::Chunk(ChunkError::TotalMismatch {
                expected,
                got: envelope.total_chunks,
            }));
        }
        match incoming.chunks.accept(envelope) {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(e) => {
                self.incoming = None;
                return Err(e.into());
            }
        }

        let Some(incoming) = self.incoming.take() else {
            return Ok(None);
        };
        let compressed_blob = incoming.chunks.assemble()?;
        let IncomingSnapshot { announcement, .. } = incoming;
        Ok(Some(ReceivedHardSync {
            snapshot: HardSyncSnapshot {
                reason: announcement.sync.reason,
                compressed_blob,
                hash: announcement.sync.data_hash,
                simulated_tick: announcement.sync.tick,
            },
            transfer: announcement.transfer,
        }))
    }

    /// Verify, decompress, persist, and load a received snapshot.
    ///
    /// The hash and size are checked before decompression. `load` is only
    /// called with a verified, fully decompressed blob; on any error the
    /// caller's world is untouched. Returns the persisted path, which the next
    /// apply overwrites.
    pub fn apply(
        &self,
        received: &ReceivedHardSync,
        load: impl FnOnce(&Path, &[u8]) -> Result<(), String>,
    ) -> Result<PathBuf, HardSyncError> {
        let snapshot = &received.snapshot;
        let announced = received.transfer.total_compressed_size;
        if snapshot.compressed_blob.len() as u64 != announced {
            return Err(HardSyncError::SizeMismatch {
                announced,
                received: snapshot.compressed_blob.len() as u64,
            });
        }
        snapshot.verify()?;

        let raw = decompress(&snapshot.compressed_blob)?;
        std::fs::create_dir_all(&self.snapshot_dir)?;
        let path = self.snapshot_dir.join(SNAPSHOT_FILE_NAME);
        std::fs::write(&path, &raw)?;

        load(&path, &raw).map_err(HardSyncError::Load)?;
        tracing::info!(
            reason = ?snapshot.reason,
            tick = snapshot.simulated_tick,
            bytes = raw.len(),
            path = %path.display(),
            "hard sync applied"
        );
        Ok(path)
    }

    /// Returns `true` while a transfer is being reassembled.
    pub fn is_receiving(&self) -> bool {
        self.incoming.is_some()
    }

    /// `(received, total)` chunks of the current transfer.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.incoming.as_ref().map(|i| i.chunks.progress())
    }

    /// Abandon any incomplete transfer.
    pub fn reset(&mut self) {
        self.incoming = None;
    }
}

/// Errors building, receiving, or applying a hard sync.
#[derive(Debug, thiserror::Error)]
pub enum HardSyncError {
    /// Only the host may start a hard sync.
    #[error("only the host can trigger a hard sync")]
    NotHost,
    /// The world could not be serialized.
    #[error("world serialization failed: {0}")]
    Serialize(String),
    /// A message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// A payload or the compressed blob was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Chunking or reassembly failed.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// The announced blob exceeds what a client will reassemble.
    #[error("announced hard sync of {0} bytes is too large")]
    TooLarge(u64),
    /// A chunk arrived with no announced transfer.
    #[error("hard sync chunk without an announced transfer")]
    NoTransfer,
    /// The reassembled blob is not the announced size.
    #[error("hard sync size mismatch: announced {announced} bytes, received {received}")]
    SizeMismatch {
        /// Size from the announcement.
        announced: u64,
        /// Size reassembled.
        received: u64,
    },
    /// The reassembled blob does not match the announced hash.
    #[error("hard sync hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Announced hash.
        expected: String,
        /// Hash of what arrived.
        actual: String,
    },
    /// The snapshot could not be persisted.
    #[error("failed to persist hard sync snapshot: {0}")]
    Io(#[from] std::io::Error),
    /// The application failed to load the snapshot.
    #[error("failed to load hard sync snapshot: {0}")]
    Load(String),
}

#[cfg(test)]
#[path = "hard_sync_tests.rs"]
mod tests;
