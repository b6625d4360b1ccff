//! State synchronization and desync recovery for host-authoritative
//! simulations.
//!
//! The host owns the world. Clients replay host-authorized commands and are
//! checked periodically: category checksums detect drift, partial resync
//! repairs individual categories, and a chunked, hash-verified hard sync
//! replaces the whole world when the drift budget is exhausted.
//!
//! [`SyncEngine`] ties every component to a [`tether_net::Transport`] and is
//! driven by one cooperative [`SyncEngine::update`] call per network tick.

pub mod category;
pub mod checksum;
pub mod chunk_transfer;
pub mod command;
pub mod coordinator;
pub mod drift;
pub mod engine;
pub mod event;
pub mod hard_sync;
pub mod resync;

pub use category::{CategoryMask, SyncCategory};
pub use checksum::{
    CategoryChecksum, ChecksumAccumulator, ChecksumSet, checksum_elements, checksum_sampled,
    get_mismatched_categories, sample_indices, stable_hash,
};
pub use chunk_transfer::{
    BlobTransmitter, ChunkEnvelope, ChunkError, ChunkReceiver, MAX_TRANSFER_CHUNKS, TransferMetadata,
    split,
};
pub use command::{
    Command, CommandChannel, CommandEnvelope, CommandError, CommandOutcome, CommandRegistry,
    IssuedCommands,
};
pub use coordinator::{
    ClientCoordinator, ClientPhase, HostCoordinator, HostPhase, ReadyOutcome, SessionError,
};
pub use drift::{DriftBudget, DriftDetector, DriftError, DriftVerdict, SyncResponsePayload};
pub use engine::{CursorUpdate, SyncEngine, SyncError, SyncWorld};
pub use event::{EventBus, MAX_QUEUED_EVENTS, SyncEvent};
pub use hard_sync::{
    HardSyncAnnouncement, HardSyncError, HardSyncManager, HardSyncMetadata, HardSyncPhase,
    HardSyncReason, HardSyncReceiver, HardSyncSnapshot, ReceivedHardSync, SNAPSHOT_FILE_NAME,
    content_hash,
};
pub use resync::{
    ApplyReport, CategoryRecord, PendingChanges, ReceivedBatch, ResyncApplier, ResyncError,
    ResyncLimits, ResyncReceiver, SendSummary, send_category_data,
};
