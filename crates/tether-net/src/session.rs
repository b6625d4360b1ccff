//! Per-session identity and authority.
//!
//! A [`SessionContext`] is created when the local peer connects and dropped
//! when it disconnects. Every component receives it explicitly instead of
//! consulting process-wide "am I host" state.

use crate::message::{Message, MessageKind};
use crate::transport::PeerId;

/// Whether the local peer is the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Single authoritative peer.
    Host,
    /// Replica of the host's state.
    Client,
}

/// Identity of the local peer within the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// This peer's transport id.
    pub local_id: PeerId,
    /// The authoritative peer's transport id (equals `local_id` on the host).
    pub host_id: PeerId,
    /// Local role.
    pub role: Role,
}

impl SessionContext {
    /// Context for the peer that created the session.
    pub fn host(local_id: PeerId) -> Self {
        Self {
            local_id,
            host_id: local_id,
            role: Role::Host,
        }
    }

    /// Context for a peer that joined `host_id`'s session.
    pub fn client(local_id: PeerId, host_id: PeerId) -> Self {
        Self {
            local_id,
            host_id,
            role: Role::Client,
        }
    }

    /// Returns `true` on the authoritative peer.
    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    /// Returns `true` if `peer` is the session's authority.
    pub fn is_from_host(&self, peer: PeerId) -> bool {
        peer == self.host_id
    }

    /// Build a payload-less message stamped with the local id.
    pub fn message(&self, kind: MessageKind, tick: i64) -> Message {
        Message::empty(kind, self.local_id, tick)
    }
}
