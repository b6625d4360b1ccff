//! Partial resynchronization of individual categories.
//!
//! The host serializes one category as a list of [`CategoryRecord`]s,
//! compresses it, and sends it as a single `SyncCategoryData` message or as a
//! run of `SyncCategoryChunk` messages. The client decodes the records one at
//! a time and hands each to the [`ResyncApplier`]; records that fail to parse
//! or apply are skipped without aborting the batch.
//!
//! Incremental deltas produced by the simulation between checks go through
//! [`PendingChanges`], the one buffer shared across threads.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tether_net::{
    DecodeError, Destination, EncodeError, Message, MessageKind, Outbox, Reliability,
    SessionContext, base64_bytes, compress, decompress,
};

use crate::category::SyncCategory;
use crate::chunk_transfer::{ChunkEnvelope, ChunkError, ChunkReceiver, split};

/// One element of a category: identity, location, and essential attributes.
///
/// Applying a record replaces whatever the receiver holds at that identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    /// Stable element identity.
    pub id: u64,
    /// Grid cell, if the element is placed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<i64>,
    /// Remaining state, keyed by attribute name.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// The element no longer exists.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

impl CategoryRecord {
    /// A record with no attributes.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            cell: None,
            attributes: BTreeMap::new(),
            removed: false,
        }
    }

    /// Builder-style cell.
    pub fn at(mut self, cell: i64) -> Self {
        self.cell = Some(cell);
        self
    }

    /// Builder-style attribute.
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// A tombstone for `id`.
    pub fn removal(id: u64) -> Self {
        Self {
            removed: true,
            ..Self::new(id)
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// `SyncCategoryData` payload: a whole compressed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDataPayload {
    /// Category the records belong to.
    pub category: SyncCategory,
    /// Delta since the last broadcast rather than a full category dump.
    #[serde(default)]
    pub incremental: bool,
    /// Number of records in the batch.
    pub record_count: u32,
    /// Compressed JSON array of records.
    #[serde(with = "base64_bytes")]
    pub compressed: Vec<u8>,
}

/// `SyncCategoryChunk` payload: one fragment of a compressed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryChunkPayload {
    /// Category the records belong to.
    pub category: SyncCategory,
    /// Delta since the last broadcast rather than a full category dump.
    #[serde(default)]
    pub incremental: bool,
    /// The fragment.
    pub chunk: ChunkEnvelope,
}

/// What a send produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    /// Records serialized.
    pub records: usize,
    /// Size of the compressed batch.
    pub compressed_bytes: usize,
    /// Messages queued (1 for a single message).
    pub messages: usize,
}

/// Size limits for category sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncLimits {
    /// Compressed batches up to this size go as one message.
    pub single_message_threshold: usize,
    /// Chunk size for larger batches.
    pub chunk_size: usize,
}

/// Host: serialize, compress, and queue `records` of `category` for `destination`.
#[allow(clippy::too_many_arguments)]
pub fn send_category_data(
    ctx: &SessionContext,
    destination: Destination,
    category: SyncCategory,
    records: &[CategoryRecord],
    incremental: bool,
    tick: i64,
    limits: ResyncLimits,
    outbox: &mut Outbox,
) -> Result<SendSummary, ResyncError> {
    let raw = serde_json::to_vec(records).map_err(ResyncError::Records)?;
    let compressed = compress(&raw);
    let compressed_bytes = compressed.len();

    let messages = if compressed_bytes <= limits.single_message_threshold {
        let payload = CategoryDataPayload {
            category,
            incremental,
            record_count: records.len() as u32,
            compressed,
        };
        outbox.push(
            destination,
            Message::with_payload(MessageKind::SyncCategoryData, ctx.local_id, tick, &payload)?,
            Reliability::ReliableOrdered,
        );
        1
    } else {
        let chunks = split(&compressed, limits.chunk_size)?;
        let count = chunks.len();
        for chunk in chunks {
            let payload = CategoryChunkPayload {
                category,
                incremental,
                chunk,
            };
            outbox.push(
                destination,
                Message::with_payload(MessageKind::SyncCategoryChunk, ctx.local_id, tick, &payload)?,
                Reliability::ReliableOrdered,
            );
        }
        count
    };

    tracing::debug!(
        %category,
        tick,
        records = records.len(),
        raw_bytes = raw.len(),
        compressed_bytes,
        messages,
        incremental,
        "category data queued"
    );
    Ok(SendSummary {
        records: records.len(),
        compressed_bytes,
        messages,
    })
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// A fully received, still compressed category batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBatch {
    /// Category the records belong to.
    pub category: SyncCategory,
    /// Delta rather than full dump.
    pub incremental: bool,
    /// Compressed JSON array of records.
    pub compressed: Vec<u8>,
}

/// Reassembles chunked category batches, one transfer per category.
#[derive(Debug, Default)]
pub struct ResyncReceiver {
    transfers: HashMap<SyncCategory, ChunkReceiver>,
}

impl ResyncReceiver {
    /// Empty receiver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `SyncCategoryData` or `SyncCategoryChunk`. Returns the batch
    /// once it is complete.
    pub fn handle_message(&mut self, message: &Message) -> Result<Option<ReceivedBatch>, ResyncError> {
        match message.kind {
            MessageKind::SyncCategoryData => {
                let payload: CategoryDataPayload = message.payload_as()?;
                Ok(Some(ReceivedBatch {
                    category: payload.category,
                    incremental: payload.incremental,
                    compressed: payload.compressed,
                }))
            }
            MessageKind::SyncCategoryChunk => {
                let payload: CategoryChunkPayload = message.payload_as()?;
                let receiver = self.transfers.entry(payload.category).or_default();
                let accepted = receiver.accept(payload.chunk);
                let complete = match accepted {
                    Ok(complete) => complete,
                    Err(e) => {
                        // A chunk from a different transfer restarts this category.
                        receiver.reset();
                        return Err(e.into());
                    }
                };
                if !complete {
                    return Ok(None);
                }
                let compressed = receiver.assemble()?;
                self.transfers.remove(&payload.category);
                Ok(Some(ReceivedBatch {
                    category: payload.category,
                    incremental: payload.incremental,
                    compressed,
                }))
            }
            other => {
                tracing::debug!(?other, "not a resync message");
                Ok(None)
            }
        }
    }

    /// Number of category transfers in progress.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Abandon every partial transfer.
    pub fn reset(&mut self) {
        self.transfers.clear();
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Records applied.
    pub applied: usize,
    /// Records skipped as unparseable or rejected by the applier.
    pub skipped: usize,
}

type RecordApplier = Box<dyn FnMut(&CategoryRecord) -> Result<(), String> + Send>;

/// Per-category record appliers supplied by the application.
#[derive(Default)]
pub struct ResyncApplier {
    appliers: HashMap<SyncCategory, RecordApplier>,
}

impl ResyncApplier {
    /// No appliers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply records of `category` with `applier`. `Err` skips the record.
    pub fn register(
        &mut self,
        category: SyncCategory,
        applier: impl FnMut(&CategoryRecord) -> Result<(), String> + Send + 'static,
    ) {
        self.appliers.insert(category, Box::new(applier));
    }

    /// Returns `true` if `category` has an applier.
    pub fn handles(&self, category: SyncCategory) -> bool {
        self.appliers.contains_key(&category)
    }

    /// Decompress and apply a batch record by record.
    pub fn apply_category_data(
        &mut self,
        category: SyncCategory,
        compressed: &[u8],
    ) -> Result<ApplyReport, ResyncError> {
        let raw = decompress(compressed)?;
        let values: Vec<serde_json::Value> =
            serde_json::from_slice(&raw).map_err(ResyncError::Records)?;

        let Some(applier) = self.appliers.get_mut(&category) else {
            tracing::warn!(%category, records = values.len(), "no applier for category, skipping batch");
            return Ok(ApplyReport {
                applied: 0,
                skipped: values.len(),
            });
        };

        let mut report = ApplyReport::default();
        for value in values {
            let record: CategoryRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(%category, "skipping unparseable record: {e}");
                    report.skipped += 1;
                    continue;
                }
            };
            match applier(&record) {
                Ok(()) => report.applied += 1,
                Err(reason) => {
                    tracing::warn!(%category, id = record.id, %reason, "skipping record");
                    report.skipped += 1;
                }
            }
        }
        tracing::debug!(%category, applied = report.applied, skipped = report.skipped, "category batch applied");
        Ok(report)
    }
}

impl std::fmt::Debug for ResyncApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncApplier")
            .field("categories", &self.appliers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pending changes
// ---------------------------------------------------------------------------

/// Shared buffer of outgoing incremental deltas.
///
/// Clones share the same buffer, so simulation callbacks on any thread can
/// push while the network tick drains.
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    inner: Arc<Mutex<Vec<(SyncCategory, CategoryRecord)>>>,
}

impl PendingChanges {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a changed record.
    pub fn push(&self, category: SyncCategory, record: CategoryRecord) {
        self.lock().push((category, record));
    }

    /// Take everything queued, grouped by category in push order.
    pub fn drain(&self) -> BTreeMap<SyncCategory, Vec<CategoryRecord>> {
        let taken = std::mem::take(&mut *self.lock());
        let mut grouped: BTreeMap<SyncCategory, Vec<CategoryRecord>> = BTreeMap::new();
        for (category, record) in taken {
            grouped.entry(category).or_default().push(record);
        }
        grouped
    }

    /// Records queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SyncCategory, CategoryRecord)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Errors sending, receiving, or applying category data.
#[derive(Debug, thiserror::Error)]
pub enum ResyncError {
    /// A payload or compressed stream was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Chunking or reassembly failed.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// The record list could not be (de)serialized.
    #[error("record list encoding failed: {0}")]
    Records(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: ResyncLimits = ResyncLimits {
        single_message_threshold: 512,
        chunk_size: 256,
    };

    fn records(n: u64) -> Vec<CategoryRecord> {
        (0..n)
            .map(|i| {
                CategoryRecord::new(i)
                    .at(i as i64 * 3)
                    .with("hp", i * 17 % 101)
                    .with("tag", format!("unit-{}", i * 7919 % 1000))
            })
            .collect()
    }

    #[test]
    fn test_small_batch_is_one_message() {
        let ctx = SessionContext::host(1);
        let mut outbox = Outbox::new();
        let summary = send_category_data(
            &ctx,
            Destination::Peer(2),
            SyncCategory::MobileEntities,
            &records(2),
            false,
            9,
            LIMITS,
            &mut outbox,
        )
        .unwrap();
        assert_eq!(summary.messages, 1);

        let out = outbox.drain();
        assert_eq!(out[0].message.kind, MessageKind::SyncCategoryData);
        let mut rx = ResyncReceiver::new();
        let batch = rx.handle_message(&out[0].message).unwrap().unwrap();
        assert_eq!(batch.category, SyncCategory::MobileEntities);
    }

    #[test]
    fn test_large_batch_is_chunked_and_reassembled() {
        let ctx = SessionContext::host(1);
        let mut outbox = Outbox::new();
        let summary = send_category_data(
            &ctx,
            Destination::All,
            SyncCategory::Structures,
            &records(200),
            false,
            9,
            LIMITS,
            &mut outbox,
        )
        .unwrap();
        assert!(summary.messages > 1);
        assert_eq!(summary.compressed_bytes.div_ceil(256), summary.messages);

        let mut messages: Vec<Message> = outbox.drain().into_iter().map(|o| o.message).collect();
        assert!(messages.iter().all(|m| m.kind == MessageKind::SyncCategoryChunk));
        messages.reverse();

        let mut rx = ResyncReceiver::new();
        let mut batch = None;
        for (i, message) in messages.iter().enumerate() {
            let result = rx.handle_message(message).unwrap();
            if i + 1 < messages.len() {
                assert!(result.is_none());
            } else {
                batch = result;
            }
        }
        let batch = batch.unwrap();
        assert_eq!(rx.in_flight(), 0);

        let seen: Arc<Mutex<Vec<CategoryRecord>>> = Arc::default();
        let sink = seen.clone();
        let mut applier = ResyncApplier::new();
        applier.register(SyncCategory::Structures, move |r| {
            sink.lock().unwrap().push(r.clone());
            Ok(())
        });
        let report = applier
            .apply_category_data(batch.category, &batch.compressed)
            .unwrap();
        assert_eq!(report, ApplyReport { applied: 200, skipped: 0 });
        assert_eq!(*seen.lock().unwrap(), records(200));
    }

    #[test]
    fn test_bad_records_are_skipped_individually() {
        let raw = serde_json::to_vec(&serde_json::json!([
            {"id": 1, "cell": 4},
            {"id": "not-a-number"},
            {"id": 3},
            {"id": 4, "attributes": {"reject": true}},
        ]))
        .unwrap();

        let mut applier = ResyncApplier::new();
        applier.register(SyncCategory::LooseItems, |r| {
            if r.attributes.contains_key("reject") {
                return Err("refused".to_string());
            }
            Ok(())
        });
        let report = applier
            .apply_category_data(SyncCategory::LooseItems, &compress(&raw))
            .unwrap();
        assert_eq!(report, ApplyReport { applied: 2, skipped: 2 });
    }

    #[test]
    fn test_corrupt_batch_is_error() {
        let mut applier = ResyncApplier::new();
        applier.register(SyncCategory::LooseItems, |_| Ok(()));
        assert!(matches!(
            applier.apply_category_data(SyncCategory::LooseItems, &[10, 0, 0, 0, 0xF0]),
            Err(ResyncError::Decode(DecodeError::CorruptStream(_)))
        ));
    }

    #[test]
    fn test_chunk_claiming_huge_transfer_is_discarded() {
        let payload = CategoryChunkPayload {
            category: SyncCategory::Structures,
            incremental: false,
            chunk: ChunkEnvelope {
                chunk_index: 0,
                total_chunks: u32::MAX,
                data: vec![0; 16],
            },
        };
        let message = Message::with_payload(MessageKind::SyncCategoryChunk, 1, 0, &payload).unwrap();

        let mut rx = ResyncReceiver::new();
        assert!(matches!(
            rx.handle_message(&message),
            Err(ResyncError::Chunk(ChunkError::TransferTooLarge { .. }))
        ));
        assert_eq!(rx.in_flight(), 1);

        // The category still accepts a well-formed transfer afterwards.
        let raw = serde_json::to_vec(&records(2)).unwrap();
        let chunk = CategoryChunkPayload {
            chunk: ChunkEnvelope {
                chunk_index: 0,
                total_chunks: 1,
                data: compress(&raw),
            },
            ..payload
        };
        let message = Message::with_payload(MessageKind::SyncCategoryChunk, 1, 0, &chunk).unwrap();
        assert!(rx.handle_message(&message).unwrap().is_some());
    }

    #[test]
    fn test_batch_claiming_huge_size_is_refused() {
        let mut applier = ResyncApplier::new();
        applier.register(SyncCategory::LooseItems, |_| Ok(()));
        assert!(matches!(
            applier.apply_category_data(SyncCategory::LooseItems, &[0xff, 0xff, 0xff, 0xff, 0x00]),
            Err(ResyncError::Decode(DecodeError::CorruptStream(_)))
        ));
    }

    #[test]
    fn test_missing_applier_skips_batch() {
        let raw = serde_json::to_vec(&records(3)).unwrap();
        let mut applier = ResyncApplier::new();
        let report = applier
            .apply_category_data(SyncCategory::Gases, &compress(&raw))
            .unwrap();
        assert_eq!(report, ApplyReport { applied: 0, skipped: 3 });
    }

    #[test]
    fn test_pending_changes_shared_across_threads() {
        let pending = PendingChanges::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pending = pending.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        pending.push(SyncCategory::FlowNetworks, CategoryRecord::new(t * 100 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        pending.push(SyncCategory::LooseItems, CategoryRecord::removal(9));
        assert_eq!(pending.len(), 101);

        let drained = pending.drain();
        assert_eq!(drained[&SyncCategory::FlowNetworks].len(), 100);
        assert!(drained[&SyncCategory::LooseItems][0].removed);
        assert!(pending.is_empty());
    }
}
