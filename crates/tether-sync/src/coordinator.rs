//! Game-start handshake.
//!
//! Host: announce `GameStarting`, stream the world (done by the engine through
//! the hard-sync path), wait for `PlayerReady` from every expected client,
//! then broadcast `GameStart`. A client that joins after the game is running
//! gets its own world transfer and its own `GameStart` once ready.
//!
//! Client: `GameStarting` moves it to loading; a successfully loaded world
//! sends `PlayerReady`; `GameStart` starts its clock.

use std::collections::BTreeSet;

use tether_net::{MessageKind, Outbox, PeerId, SessionContext};

/// Host handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    /// Not started.
    Lobby,
    /// World sent, waiting for `PlayerReady`.
    AwaitingReady,
    /// `GameStart` broadcast.
    Running,
}

/// Result of a `PlayerReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Still waiting for this many clients.
    Waiting(usize),
    /// Every client was ready; `GameStart` was broadcast.
    Started,
    /// A late joiner finished loading; it was sent its own `GameStart`.
    LateJoinerStarted,
    /// Ready message outside a handshake.
    Ignored,
}

/// Host side of the handshake.
#[derive(Debug)]
pub struct HostCoordinator {
    phase: HostPhase,
    expected: BTreeSet<PeerId>,
    ready: BTreeSet<PeerId>,
}

impl Default for HostCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCoordinator {
    /// A coordinator in the lobby.
    pub fn new() -> Self {
        Self {
            phase: HostPhase::Lobby,
            expected: BTreeSet::new(),
            ready: BTreeSet::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HostPhase {
        self.phase
    }

    /// Clients not yet ready.
    pub fn waiting_for(&self) -> Vec<PeerId> {
        self.expected.difference(&self.ready).copied().collect()
    }

    /// Announce `GameStarting` and wait for `clients`.
    ///
    /// Returns `true` if there was nobody to wait for and `GameStart` went
    /// out immediately.
    pub fn begin(
        &mut self,
        ctx: &SessionContext,
        clients: impl IntoIterator<Item = PeerId>,
        tick: i64,
        outbox: &mut Outbox,
    ) -> Result<bool, SessionError> {
        if !ctx.is_host() {
            return Err(SessionError::NotHost);
        }
        if self.phase != HostPhase::Lobby {
            return Err(SessionError::AlreadyStarted);
        }

        self.expected = clients.into_iter().collect();
        self.ready.clear();
        outbox.send_to_all(ctx.message(MessageKind::GameStarting, tick));
        self.phase = HostPhase::AwaitingReady;
        tracing::info!(clients = self.expected.len(), tick, "game starting");

        Ok(self.maybe_start(ctx, tick, outbox))
    }

    /// A client joined mid-handshake; it must load the world too.
    pub fn add_client(&mut self, peer: PeerId) {
        if self.phase == HostPhase::AwaitingReady {
            self.expected.insert(peer);
        }
    }

    /// Record a `PlayerReady` from `peer`.
    pub fn handle_player_ready(
        &mut self,
        ctx: &SessionContext,
        peer: PeerId,
        tick: i64,
        outbox: &mut Outbox,
    ) -> ReadyOutcome {
        match self.phase {
            HostPhase::Lobby => {
                tracing::debug!(peer, "player ready before game start, ignoring");
                ReadyOutcome::Ignored
            }
            HostPhase::Running => {
                outbox.send_to(peer, ctx.message(MessageKind::GameStart, tick));
                tracing::info!(peer, tick, "late joiner ready");
                ReadyOutcome::LateJoinerStarted
            }
            HostPhase::AwaitingReady => {
                if !self.expected.contains(&peer) {
                    tracing::warn!(peer, "player ready from unexpected peer");
                    return ReadyOutcome::Ignored;
                }
                self.ready.insert(peer);
                if self.maybe_start(ctx, tick, outbox) {
                    ReadyOutcome::Started
                } else {
                    ReadyOutcome::Waiting(self.expected.len() - self.ready.len())
                }
            }
        }
    }

    /// A client left. Returns `true` if that completed the handshake.
    pub fn on_peer_left(
        &mut self,
        ctx: &SessionContext,
        peer: PeerId,
        tick: i64,
        outbox: &mut Outbox,
    ) -> bool {
        self.expected.remove(&peer);
        self.ready.remove(&peer);
        self.phase == HostPhase::AwaitingReady && self.maybe_start(ctx, tick, outbox)
    }

    fn maybe_start(&mut self, ctx: &SessionContext, tick: i64, outbox: &mut Outbox) -> bool {
        if !self.expected.is_subset(&self.ready) {
            return false;
        }
        outbox.send_to_all(ctx.message(MessageKind::GameStart, tick));
        self.phase = HostPhase::Running;
        tracing::info!(players = self.ready.len(), tick, "game started");
        true
    }

    /// Back to the lobby.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Client handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Waiting for the host.
    Lobby,
    /// `GameStarting` received, world transfer pending.
    Loading,
    /// World loaded, `PlayerReady` sent.
    Ready,
    /// `GameStart` received.
    Running,
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct ClientCoordinator {
    phase: ClientPhase,
}

impl Default for ClientCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCoordinator {
    /// A coordinator in the lobby.
    pub fn new() -> Self {
        Self {
            phase: ClientPhase::Lobby,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// `GameStarting` arrived.
    pub fn handle_game_starting(&mut self) {
        if self.phase == ClientPhase::Lobby {
            self.phase = ClientPhase::Loading;
        }
    }

    /// An initial world transfer was loaded; tell the host.
    pub fn world_loaded(&mut self, ctx: &SessionContext, tick: i64, outbox: &mut Outbox) {
        if self.phase == ClientPhase::Running {
            return;
        }
        outbox.send_to(ctx.host_id, ctx.message(MessageKind::PlayerReady, tick));
        self.phase = ClientPhase::Ready;
        tracing::info!(tick, "world loaded, ready");
    }

    /// `GameStart` arrived.
    pub fn handle_game_start(&mut self) {
        self.phase = ClientPhase::Running;
    }

    /// Back to the lobby.
    pub fn reset(&mut self) {
        self.phase = ClientPhase::Lobby;
    }
}

/// Errors driving the handshake.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Only the host starts the game.
    #[error("only the host can start the game")]
    NotHost,
    /// The game was already started.
    #[error("game already started")]
    AlreadyStarted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_net::Destination;

    fn kinds(outbox: &mut Outbox) -> Vec<(Destination, MessageKind)> {
        outbox
            .drain()
            .into_iter()
            .map(|o| (o.destination, o.message.kind))
            .collect()
    }

    #[test]
    fn test_host_waits_for_every_client() {
        let ctx = SessionContext::host(1);
        let mut host = HostCoordinator::new();
        let mut outbox = Outbox::new();

        assert!(!host.begin(&ctx, [2, 3], 0, &mut outbox).unwrap());
        assert_eq!(kinds(&mut outbox), vec![(Destination::All, MessageKind::GameStarting)]);

        assert_eq!(host.handle_player_ready(&ctx, 2, 0, &mut outbox), ReadyOutcome::Waiting(1));
        assert_eq!(host.handle_player_ready(&ctx, 2, 0, &mut outbox), ReadyOutcome::Waiting(1));
        assert!(outbox.is_empty());

        assert_eq!(host.handle_player_ready(&ctx, 3, 0, &mut outbox), ReadyOutcome::Started);
        assert_eq!(kinds(&mut outbox), vec![(Destination::All, MessageKind::GameStart)]);
        assert_eq!(host.phase(), HostPhase::Running);
    }

    #[test]
    fn test_no_clients_starts_immediately() {
        let ctx = SessionContext::host(1);
        let mut host = HostCoordinator::new();
        let mut outbox = Outbox::new();
        assert!(host.begin(&ctx, [], 0, &mut outbox).unwrap());
        assert!(matches!(
            host.begin(&ctx, [], 0, &mut outbox),
            Err(SessionError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_departed_client_no_longer_blocks() {
        let ctx = SessionContext::host(1);
        let mut host = HostCoordinator::new();
        let mut outbox = Outbox::new();
        host.begin(&ctx, [2, 3], 0, &mut outbox).unwrap();
        host.handle_player_ready(&ctx, 2, 0, &mut outbox);
        assert_eq!(host.waiting_for(), vec![3]);
        assert!(host.on_peer_left(&ctx, 3, 0, &mut outbox));
        assert_eq!(host.phase(), HostPhase::Running);
    }

    #[test]
    fn test_late_joiner_gets_own_start() {
        let ctx = SessionContext::host(1);
        let mut host = HostCoordinator::new();
        let mut outbox = Outbox::new();
        host.begin(&ctx, [], 0, &mut outbox).unwrap();
        outbox.drain();

        assert_eq!(
            host.handle_player_ready(&ctx, 9, 400, &mut outbox),
            ReadyOutcome::LateJoinerStarted
        );
        assert_eq!(kinds(&mut outbox), vec![(Destination::Peer(9), MessageKind::GameStart)]);
    }

    #[test]
    fn test_client_cannot_begin() {
        let ctx = SessionContext::client(2, 1);
        let mut host = HostCoordinator::new();
        assert!(matches!(
            host.begin(&ctx, [], 0, &mut Outbox::new()),
            Err(SessionError::NotHost)
        ));
    }

    #[test]
    fn test_client_flow() {
        let ctx = SessionContext::client(2, 1);
        let mut client = ClientCoordinator::new();
        client.handle_game_starting();
        assert_eq!(client.phase(), ClientPhase::Loading);

        let mut outbox = Outbox::new();
        client.world_loaded(&ctx, 0, &mut outbox);
        assert_eq!(kinds(&mut outbox), vec![(Destination::Peer(1), MessageKind::PlayerReady)]);
        assert_eq!(client.phase(), ClientPhase::Ready);

        client.handle_game_start();
        assert_eq!(client.phase(), ClientPhase::Running);
    }
}
