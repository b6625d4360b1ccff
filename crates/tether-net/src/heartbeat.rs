//! Heartbeat-based liveness detection, independent of simulation traffic.
//!
//! The host broadcasts a [`HeartbeatPayload`] every interval and evicts
//! clients whose last acknowledgement is older than the timeout. Clients
//! answer each heartbeat with a [`HeartbeatAck`] and declare the host lost
//! once, then halt, if heartbeats stop arriving.
//!
//! All timing is explicit: callers pass `now` into every method.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::message::{DecodeError, EncodeError, Message, MessageKind};
use crate::session::SessionContext;
use crate::transport::{Outbox, PeerId};

/// Host heartbeat body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Milliseconds since the host monitor started.
    pub host_time_ms: u64,
    /// Host simulation tick.
    pub sim_tick: i64,
}

/// Client answer echoing the host timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// The `host_time_ms` of the heartbeat being acknowledged.
    pub echoed_host_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ClientLiveness {
    last_ack: Instant,
    round_trip: Option<Duration>,
}

/// Host-side monitor: periodic heartbeat broadcast and per-client eviction.
#[derive(Debug)]
pub struct HostHeartbeat {
    interval: Duration,
    timeout: Duration,
    epoch: Instant,
    last_sent: Option<Instant>,
    clients: HashMap<PeerId, ClientLiveness>,
}

impl HostHeartbeat {
    /// Create a monitor whose clock starts at `now`.
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            epoch: now,
            last_sent: None,
            clients: HashMap::new(),
        }
    }

    /// Start tracking a newly connected client.
    pub fn on_client_connected(&mut self, peer: PeerId, now: Instant) {
        self.clients.insert(
            peer,
            ClientLiveness {
                last_ack: now,
                round_trip: None,
            },
        );
    }

    /// Stop tracking a client that left.
    pub fn on_client_disconnected(&mut self, peer: PeerId) {
        self.clients.remove(&peer);
    }

    /// Refresh a client's liveness from an acknowledgement.
    pub fn handle_ack(
        &mut self,
        peer: PeerId,
        message: &Message,
        now: Instant,
    ) -> Result<(), DecodeError> {
        let ack: HeartbeatAck = message.payload_as()?;
        let now_ms = self.millis_since_epoch(now);
        let Some(entry) = self.clients.get_mut(&peer) else {
            tracing::debug!(peer, "heartbeat ack from untracked peer");
            return Ok(());
        };
        entry.last_ack = now;
        entry.round_trip = now_ms
            .checked_sub(ack.echoed_host_time_ms)
            .map(Duration::from_millis);
        Ok(())
    }

    /// Broadcast a heartbeat if due, then evict timed-out clients.
    ///
    /// Returns the peers evicted this tick.
    pub fn tick(
        &mut self,
        ctx: &SessionContext,
        now: Instant,
        sim_tick: i64,
        outbox: &mut Outbox,
    ) -> Result<Vec<PeerId>, EncodeError> {
        let due = self
            .last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.interval);
        if due {
            let payload = HeartbeatPayload {
                host_time_ms: self.millis_since_epoch(now),
                sim_tick,
            };
            outbox.send_to_all(Message::with_payload(
                MessageKind::Heartbeat,
                ctx.local_id,
                sim_tick,
                &payload,
            )?);
            self.last_sent = Some(now);
        }

        let timeout = self.timeout;
        let stale: Vec<PeerId> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_ack) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for peer in &stale {
            tracing::warn!(peer, timeout_secs = timeout.as_secs(), "client heartbeat timed out");
            self.clients.remove(peer);
        }
        Ok(stale)
    }

    /// Last measured round trip to `peer`. Advisory only.
    pub fn round_trip(&self, peer: PeerId) -> Option<Duration> {
        self.clients.get(&peer).and_then(|c| c.round_trip)
    }

    /// Number of tracked clients.
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Client-side monitor: answers heartbeats and detects a silent host.
#[derive(Debug)]
pub struct ClientHeartbeat {
    timeout: Duration,
    last_received: Instant,
    last_host_tick: Option<i64>,
    halted: bool,
}

impl ClientHeartbeat {
    /// Create a monitor that considers the host alive as of `now`.
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_received: now,
            last_host_tick: None,
            halted: false,
        }
    }

    /// Reset on (re)connect.
    pub fn on_connected(&mut self, now: Instant) {
        self.last_received = now;
        self.last_host_tick = None;
        self.halted = false;
    }

    /// Record a heartbeat and queue the acknowledgement to the host.
    pub fn handle_heartbeat(
        &mut self,
        ctx: &SessionContext,
        message: &Message,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), HeartbeatError> {
        let heartbeat: HeartbeatPayload = message.payload_as()?;
        self.last_received = now;
        self.last_host_tick = Some(heartbeat.sim_tick);

        let ack = HeartbeatAck {
            echoed_host_time_ms: heartbeat.host_time_ms,
        };
        outbox.send_to(
            ctx.host_id,
            Message::with_payload(MessageKind::HeartbeatAck, ctx.local_id, message.tick, &ack)?,
        );
        Ok(())
    }

    /// Returns `true` exactly once, on the tick the host is presumed gone.
    /// The monitor halts afterwards until [`ClientHeartbeat::on_connected`].
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.halted {
            return false;
        }
        if now.saturating_duration_since(self.last_received) > self.timeout {
            tracing::error!(
                silent_secs = now.saturating_duration_since(self.last_received).as_secs(),
                "no heartbeat from host, presuming disconnect"
            );
            self.halted = true;
            return true;
        }
        false
    }

    /// Simulation tick carried by the most recent heartbeat.
    pub fn last_host_tick(&self) -> Option<i64> {
        self.last_host_tick
    }

    /// Returns `true` once the host has been declared lost.
    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

/// Errors handling a heartbeat.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The heartbeat payload was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The acknowledgement could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
