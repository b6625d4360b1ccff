//! Engine events and observer registration.
//!
//! The engine reports everything the hosting application may act on as a
//! [`SyncEvent`]. Observers registered with [`EventBus::subscribe`] see each
//! event as it happens. Without observers, events are queued for polling.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tether_net::{Message, PeerId, Role};

use crate::category::{CategoryMask, SyncCategory};
use crate::hard_sync::HardSyncReason;
use crate::resync::ApplyReport;

/// Something the hosting application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The local peer has a session context.
    Connected {
        /// Local role.
        role: Role,
    },
    /// The transport lost the session.
    Disconnected,
    /// No heartbeat from the host within the timeout. Fired once.
    HostDisconnected,
    /// A client stopped acknowledging heartbeats and was evicted.
    ClientTimedOut(PeerId),
    /// A remote peer joined.
    PeerJoined(PeerId),
    /// A remote peer left.
    PeerLeft(PeerId),
    /// Host: a client reported checksum mismatches.
    DriftDetected {
        /// Reporting client.
        peer: PeerId,
        /// Tick of the check.
        tick: i64,
        /// Disagreeing categories.
        mismatched: CategoryMask,
    },
    /// Client: local checksums disagreed with the host's.
    LocalDrift {
        /// Tick of the check.
        tick: i64,
        /// Disagreeing categories.
        mismatched: CategoryMask,
    },
    /// Client: a category batch was applied.
    CategoryResynced {
        /// Category applied.
        category: SyncCategory,
        /// Incremental delta rather than full resync.
        incremental: bool,
        /// Applied and skipped record counts.
        report: ApplyReport,
    },
    /// Host: a hard sync was started.
    HardSyncStarted {
        /// Why.
        reason: HardSyncReason,
    },
    /// Client: a hard sync was verified and loaded.
    HardSyncApplied {
        /// Why the host sent it.
        reason: HardSyncReason,
        /// Host tick of the snapshot.
        tick: i64,
        /// Where the blob was persisted.
        path: PathBuf,
    },
    /// Client: a hard sync was rejected or failed to load. The previous
    /// world is intact.
    HardSyncFailed {
        /// Failure description.
        error: String,
    },
    /// Host: a client asked to pause while it resyncs.
    SyncPauseRequested(PeerId),
    /// Host: a client finished resyncing.
    SyncResumeRequested(PeerId),
    /// Client: the host announced the game is starting.
    GameStarting,
    /// The shared clock started.
    GameStarted,
    /// Host: a client finished loading.
    PlayerReady(PeerId),
    /// The host refused a command.
    CommandRejected {
        /// Command tag.
        tag: String,
        /// Submitting peer.
        origin: PeerId,
        /// Validator's reason.
        reason: String,
    },
    /// A newer cursor position arrived.
    CursorMoved {
        /// Cursor owner.
        peer: PeerId,
        /// Cursor payload.
        update: crate::engine::CursorUpdate,
    },
    /// A ping was answered.
    Pong {
        /// Answering peer.
        peer: PeerId,
        /// Measured round trip.
        round_trip: Duration,
    },
    /// A peer reported an error.
    PeerError {
        /// Reporting peer.
        peer: PeerId,
        /// Error text.
        text: String,
    },
    /// Traffic the engine does not interpret (chat, lobby, pause, ...).
    Received {
        /// Sending peer.
        peer: PeerId,
        /// The decoded message.
        message: Message,
    },
}

type Observer = Box<dyn FnMut(&SyncEvent) + Send>;

/// Most events kept for polling before the oldest are dropped.
pub const MAX_QUEUED_EVENTS: usize = 4_096;

/// Observer list plus a pollable queue.
///
/// Events go to observers when any are subscribed and to the queue
/// otherwise, so an application that only subscribes never accumulates
/// anything. The queue is bounded by [`MAX_QUEUED_EVENTS`]; a poller that
/// falls behind loses the oldest events first.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Observer>,
    queue: VecDeque<SyncEvent>,
    dropped: u64,
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `observer` for every future event. Events already queued stay
    /// queued until drained.
    pub fn subscribe(&mut self, observer: impl FnMut(&SyncEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Notify observers, or queue `event` when there are none.
    pub fn emit(&mut self, event: SyncEvent) {
        if !self.observers.is_empty() {
            for observer in &mut self.observers {
                observer(&event);
            }
            return;
        }
        if self.queue.len() == MAX_QUEUED_EVENTS {
            self.queue.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                tracing::warn!(dropped = self.dropped, "event queue full, dropping oldest events");
            }
        }
        self.queue.push_back(event);
    }

    /// Take every queued event.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        self.queue.drain(..).collect()
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .field("queued", &self.queue.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}
