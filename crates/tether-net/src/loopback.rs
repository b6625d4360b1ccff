//! In-memory transport for single-process sessions and tests.
//!
//! A [`LoopbackHub`] plays the role of the network: every
//! [`LoopbackTransport`] created from it can host or join a session, and
//! sends are queued on the recipients' event queues until they poll.
//! Unreliable traffic can be dropped, and frames can be tampered with in
//! transit to exercise integrity checks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transport::{PeerId, Reliability, Transport, TransportError, TransportEvent};

/// Hook that may rewrite a frame between `from` and `to`.
pub type TamperFn = Box<dyn FnMut(PeerId, PeerId, &mut Vec<u8>) + Send>;

#[derive(Default)]
struct HubState {
    next_id: PeerId,
    host: Option<PeerId>,
    max_peers: usize,
    members: BTreeMap<PeerId, VecDeque<TransportEvent>>,
    drop_unreliable: bool,
    tamper: Option<TamperFn>,
}

impl HubState {
    fn deliver(&mut self, from: PeerId, to: PeerId, bytes: &[u8], reliability: Reliability) {
        if reliability == Reliability::Unreliable && self.drop_unreliable {
            return;
        }
        let mut bytes = bytes.to_vec();
        if let Some(tamper) = self.tamper.as_mut() {
            tamper(from, to, &mut bytes);
        }
        if let Some(queue) = self.members.get_mut(&to) {
            queue.push_back(TransportEvent::DataReceived { peer: from, bytes });
        }
    }
}

/// Shared in-memory "network".
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport endpoint attached to this hub.
    pub fn endpoint(&self) -> LoopbackTransport {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            state.next_id
        };
        LoopbackTransport {
            hub: self.clone(),
            id,
            connected: false,
        }
    }

    /// Drop every unreliable frame while `true`.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.lock().drop_unreliable = drop;
    }

    /// Install or clear a frame tampering hook.
    pub fn set_tamper(&self, tamper: Option<TamperFn>) {
        self.lock().tamper = tamper;
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One peer's endpoint on a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    id: PeerId,
    connected: bool,
}

impl LoopbackTransport {
    /// Returns `true` while attached to a session.
    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Transport for LoopbackTransport {
    fn initialize(&mut self) -> bool {
        true
    }

    fn host(&mut self, max_peers: usize) -> Result<String, TransportError> {
        let mut state = self.hub.lock();
        if state.host.is_some_and(|h| h != self.id) {
            return Err(TransportError::Backend("hub already has a host".to_string()));
        }
        state.host = Some(self.id);
        state.max_peers = max_peers;
        state
            .members
            .entry(self.id)
            .or_default()
            .push_back(TransportEvent::Connected);
        self.connected = true;
        Ok(format!("loopback:{}", self.id))
    }

    fn join(&mut self, token: &str) -> Result<(), TransportError> {
        let host_id: PeerId = token
            .strip_prefix("loopback:")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TransportError::InvalidToken(token.to_string()))?;

        let mut state = self.hub.lock();
        if state.host != Some(host_id) {
            return Err(TransportError::InvalidToken(token.to_string()));
        }
        if state.members.len() >= state.max_peers {
            return Err(TransportError::SessionFull(state.max_peers));
        }

        let existing: Vec<PeerId> = state.members.keys().copied().collect();
        for peer in &existing {
            if let Some(queue) = state.members.get_mut(peer) {
                queue.push_back(TransportEvent::PeerJoined(self.id));
            }
        }
        let queue = state.members.entry(self.id).or_default();
        queue.push_back(TransportEvent::Connected);
        for peer in existing {
            queue.push_back(TransportEvent::PeerJoined(peer));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let mut state = self.hub.lock();
        state.members.remove(&self.id);
        let was_host = state.host == Some(self.id);
        if was_host {
            state.host = None;
        }
        for queue in state.members.values_mut() {
            queue.push_back(TransportEvent::PeerLeft(self.id));
            if was_host {
                queue.push_back(TransportEvent::Disconnected);
            }
        }
        self.connected = false;
    }

    fn local_id(&self) -> PeerId {
        self.id
    }

    fn send_to_all(
        &mut self,
        bytes: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut state = self.hub.lock();
        let peers: Vec<PeerId> = state
            .members
            .keys()
            .copied()
            .filter(|p| *p != self.id)
            .collect();
        for peer in peers {
            state.deliver(self.id, peer, bytes, reliability);
        }
        Ok(())
    }

    fn send_to(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut state = self.hub.lock();
        if !state.members.contains_key(&peer) {
            return Err(TransportError::UnknownPeer(peer));
        }
        state.deliver(self.id, peer, bytes, reliability);
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut state = self.hub.lock();
        match state.members.get_mut(&self.id) {
            Some(queue) => queue.drain(..).collect(),
            None if self.connected => {
                self.connected = false;
                vec![TransportEvent::Disconnected]
            }
            None => Vec::new(),
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
