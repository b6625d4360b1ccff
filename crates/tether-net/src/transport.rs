//! Pluggable transport interface and the per-tick outbox.
//!
//! The sync engine never talks to sockets directly. It consumes a
//! [`Transport`] (peer discovery, NAT traversal and raw delivery live behind
//! it) and queues its own sends in an [`Outbox`] that is flushed once per tick.

use crate::message::Message;

/// Transport-assigned peer identifier.
pub type PeerId = u64;

/// Delivery guarantee requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Delivered once, in send order, per peer pair.
    ReliableOrdered,
    /// May be lost, duplicated, or reordered.
    Unreliable,
}

/// Events surfaced by a transport when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The local peer joined or created a session.
    Connected,
    /// The local peer lost its session.
    Disconnected,
    /// A remote peer joined.
    PeerJoined(PeerId),
    /// A remote peer left.
    PeerLeft(PeerId),
    /// Raw bytes arrived from a remote peer.
    DataReceived {
        /// Sending peer.
        peer: PeerId,
        /// Received frame.
        bytes: Vec<u8>,
    },
}

/// Errors surfaced by a transport. Never fatal to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport has no active session.
    #[error("transport is not connected")]
    NotConnected,
    /// The target peer is unknown to the transport.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    /// The connection token could not be resolved.
    #[error("invalid connection token `{0}`")]
    InvalidToken(String),
    /// The session is full.
    #[error("session is full ({0} peers)")]
    SessionFull(usize),
    /// Backend-specific failure.
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// The raw peer-to-peer transport consumed by the engine.
pub trait Transport {
    /// Prepare the backend. Returns `false` if it is unavailable.
    fn initialize(&mut self) -> bool;

    /// Open a session for up to `max_peers` peers and return a token others can join with.
    fn host(&mut self, max_peers: usize) -> Result<String, TransportError>;

    /// Join the session identified by `token`.
    fn join(&mut self, token: &str) -> Result<(), TransportError>;

    /// Leave the current session.
    fn disconnect(&mut self);

    /// Identifier of the local peer.
    fn local_id(&self) -> PeerId;

    /// Send to every other peer in the session.
    fn send_to_all(&mut self, bytes: &[u8], reliability: Reliability)
    -> Result<(), TransportError>;

    /// Send to a single peer.
    fn send_to(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError>;

    /// Drain events received since the last poll.
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Where an outgoing message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every other peer.
    All,
    /// One peer.
    Peer(PeerId),
}

/// A message queued for sending at the end of the tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Recipient(s).
    pub destination: Destination,
    /// Message to encode and send.
    pub message: Message,
    /// Requested delivery guarantee.
    pub reliability: Reliability,
}

/// Messages produced during one tick, in production order.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outgoing>,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reliable broadcast.
    pub fn send_to_all(&mut self, message: Message) {
        self.push(Destination::All, message, Reliability::ReliableOrdered);
    }

    /// Queue a reliable send to one peer.
    pub fn send_to(&mut self, peer: PeerId, message: Message) {
        self.push(Destination::Peer(peer), message, Reliability::ReliableOrdered);
    }

    /// Queue a message with explicit destination and reliability.
    pub fn push(&mut self, destination: Destination, message: Message, reliability: Reliability) {
        self.items.push(Outgoing {
            destination,
            message,
            reliability,
        });
    }

    /// Take every queued message, leaving the outbox empty.
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.items)
    }

    /// Queued messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Outgoing> {
        self.items.iter()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encode and hand every queued message to `transport`.
    ///
    /// Send failures are logged and dropped; the next periodic cycle retries
    /// whatever state they carried. Returns the number of messages sent.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> usize {
        let mut sent = 0;
        for out in self.drain() {
            let bytes = match out.message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(kind = ?out.message.kind, "failed to encode message: {e}");
                    continue;
                }
            };
            let result = match out.destination {
                Destination::All => transport.send_to_all(&bytes, out.reliability),
                Destination::Peer(peer) => transport.send_to(peer, &bytes, out.reliability),
            };
            match result {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    kind = ?out.message.kind,
                    destination = ?out.destination,
                    bytes = bytes.len(),
                    "send failed: {e}"
                ),
            }
        }
        sent
    }
}
