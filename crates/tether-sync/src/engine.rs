//! The sync engine: one cooperative tick drives every component.
//!
//! [`SyncEngine::update`] is called by the application between simulation
//! steps. Each call drains the transport, decodes and dispatches every
//! message, runs the timers (heartbeat, sync check, periodic hard sync,
//! pending initial loads, incremental deltas, hard-sync transmission), and
//! flushes the outbox. Nothing runs in the background, and resync data is
//! applied inside `update`, where the simulation is quiescent.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_config::{ConfigError, SyncConfig};
use tether_net::{
    ClientHeartbeat, DecodeError, Destination, EncodeError, HeartbeatError, HostHeartbeat,
    LatestWins, Message, MessageKind, Outbox, PeerId, Reliability, Role, SessionContext, Transport,
    TransportError, TransportEvent,
};

use crate::category::{CategoryMask, SyncCategory};
use crate::checksum::ChecksumSet;
use crate::command::{Command, CommandChannel, CommandError, CommandOutcome, CommandRegistry};
use crate::coordinator::{
    ClientCoordinator, ClientPhase, HostCoordinator, HostPhase, ReadyOutcome, SessionError,
};
use crate::drift::{DriftBudget, DriftDetector, DriftError};
use crate::event::{EventBus, SyncEvent};
use crate::hard_sync::{
    HardSyncError, HardSyncManager, HardSyncPhase, HardSyncReason, HardSyncReceiver,
};
use crate::resync::{
    CategoryRecord, PendingChanges, ResyncApplier, ResyncError, ResyncLimits, ResyncReceiver,
    send_category_data,
};

/// The application's world, as seen by the engine.
pub trait SyncWorld {
    /// Checksums of every category at `tick`. Continuous categories sample
    /// `sample_count` cells seeded by `tick`.
    fn checksums(&self, tick: i64, sample_count: usize) -> ChecksumSet;

    /// Current records of one category, for partial resync.
    fn category_records(&self, category: SyncCategory) -> Vec<CategoryRecord>;

    /// The whole authoritative world as one blob.
    fn serialize_world(&self) -> Result<Vec<u8>, String>;

    /// Replace the local world with a received blob, persisted at `path`.
    fn load_world(&mut self, path: &Path, blob: &[u8]) -> Result<(), String>;
}

/// `CursorUpdate` payload. Newer timestamps supersede older ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    /// Sender clock, milliseconds.
    pub timestamp_ms: u64,
    /// World X.
    pub x: f64,
    /// World Y.
    pub y: f64,
}

/// Host welcome, broadcast when a peer joins. Tells the joiner who the host is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PlayerJoinedPayload {
    peer: PeerId,
    host_id: PeerId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PingPayload {
    sent_ms: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Host/client sync engine over a transport `T`.
pub struct SyncEngine<T: Transport> {
    transport: T,
    config: SyncConfig,
    epoch: Instant,
    sim_tick: i64,

    ctx: Option<SessionContext>,
    joining: bool,
    clients: BTreeSet<PeerId>,
    outbox: Outbox,
    events: EventBus,

    host_heartbeat: Option<HostHeartbeat>,
    client_heartbeat: Option<ClientHeartbeat>,
    drift: DriftDetector,
    budget: DriftBudget,
    commands: CommandChannel,
    resync_rx: ResyncReceiver,
    applier: ResyncApplier,
    pending: PendingChanges,
    hard_sync: HardSyncManager,
    hard_sync_rx: HardSyncReceiver,
    live_resync_paused: bool,
    pending_initial_loads: BTreeSet<PeerId>,
    host_coord: HostCoordinator,
    client_coord: ClientCoordinator,
    cursors: LatestWins<PeerId>,
}

impl<T: Transport> SyncEngine<T> {
    /// Validate `config` and initialize `transport`.
    pub fn new(mut transport: T, config: SyncConfig, now: Instant) -> Result<Self, SyncError> {
        config.validate()?;
        if !transport.initialize() {
            return Err(SyncError::TransportUnavailable);
        }
        let tolerated = CategoryMask::from_bits(config.tolerated_categories);
        Ok(Self {
            drift: DriftDetector::new(config.sync_check_interval(), now),
            budget: DriftBudget::new(config.drift_error_threshold, tolerated),
            hard_sync: HardSyncManager::new(config.chunk_size_bytes, config.hard_sync_interval_ticks),
            hard_sync_rx: HardSyncReceiver::new(config.snapshot_dir.clone()),
            transport,
            config,
            epoch: now,
            sim_tick: 0,
            ctx: None,
            joining: false,
            clients: BTreeSet::new(),
            outbox: Outbox::new(),
            events: EventBus::new(),
            host_heartbeat: None,
            client_heartbeat: None,
            commands: CommandChannel::default(),
            resync_rx: ResyncReceiver::new(),
            applier: ResyncApplier::new(),
            pending: PendingChanges::new(),
            live_resync_paused: false,
            pending_initial_loads: BTreeSet::new(),
            host_coord: HostCoordinator::new(),
            client_coord: ClientCoordinator::new(),
            cursors: LatestWins::new(),
        })
    }

    // -- Session lifecycle ---------------------------------------------------

    /// Open a session as host. Returns the token clients join with.
    pub fn host(&mut self, max_peers: usize, now: Instant) -> Result<String, SyncError> {
        self.reset_session();
        let token = self.transport.host(max_peers)?;
        let ctx = SessionContext::host(self.transport.local_id());
        self.host_heartbeat = Some(HostHeartbeat::new(
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
            now,
        ));
        self.drift.reset(now);
        tracing::info!(local_id = ctx.local_id, max_peers, "hosting session");
        self.ctx = Some(ctx);
        self.events.emit(SyncEvent::Connected { role: Role::Host });
        Ok(token)
    }

    /// Join a hosted session. The session context is established when the
    /// host's welcome arrives.
    pub fn join(&mut self, token: &str, now: Instant) -> Result<(), SyncError> {
        self.reset_session();
        self.transport.join(token)?;
        self.joining = true;
        self.client_heartbeat = Some(ClientHeartbeat::new(self.config.heartbeat_timeout(), now));
        tracing::info!(local_id = self.transport.local_id(), "joining session");
        Ok(())
    }

    /// Leave the session and drop all in-flight state.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.reset_session();
    }

    fn reset_session(&mut self) {
        if self.hard_sync_rx.is_receiving() || self.resync_rx.in_flight() > 0 {
            tracing::info!("session reset, abandoning incomplete transfers");
        }
        self.ctx = None;
        self.joining = false;
        self.clients.clear();
        self.outbox.drain();
        self.host_heartbeat = None;
        self.client_heartbeat = None;
        self.budget.reset();
        self.resync_rx.reset();
        self.pending.clear();
        self.hard_sync.abort();
        self.hard_sync_rx.reset();
        self.live_resync_paused = false;
        self.pending_initial_loads.clear();
        self.host_coord.reset();
        self.client_coord.reset();
        self.cursors.clear();
    }

    // -- Tick -----------------------------------------------------------------

    /// Run one network tick. Returns the number of messages sent.
    pub fn update<W: SyncWorld>(&mut self, now: Instant, sim_tick: i64, world: &mut W) -> usize {
        self.sim_tick = sim_tick;
        for event in self.transport.poll_events() {
            self.handle_transport_event(event, now, world);
        }
        self.run_timers(now, world);
        self.outbox.flush(&mut self.transport)
    }

    fn handle_transport_event<W: SyncWorld>(
        &mut self,
        event: TransportEvent,
        now: Instant,
        world: &mut W,
    ) {
        match event {
            TransportEvent::Connected => {
                if let Some(heartbeat) = self.client_heartbeat.as_mut() {
                    heartbeat.on_connected(now);
                }
            }
            TransportEvent::Disconnected => {
                tracing::warn!("transport session lost");
                self.reset_session();
                self.events.emit(SyncEvent::Disconnected);
            }
            TransportEvent::PeerJoined(peer) => self.on_peer_joined(peer, now),
            TransportEvent::PeerLeft(peer) => {
                self.events.emit(SyncEvent::PeerLeft(peer));
                self.forget_peer(peer);
            }
            TransportEvent::DataReceived { peer, bytes } => {
                let message = match Message::decode(&bytes) {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::trace!(peer, bytes = bytes.len(), "ignoring unrecognized frame");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(peer, bytes = bytes.len(), "dropping malformed frame: {e}");
                        return;
                    }
                };
                let kind = message.kind;
                if let Err(e) = self.handle_message(peer, message, now, world) {
                    tracing::warn!(peer, ?kind, tick = self.sim_tick, "dropping message: {e}");
                }
            }
        }
    }

    fn on_peer_joined(&mut self, peer: PeerId, now: Instant) {
        self.events.emit(SyncEvent::PeerJoined(peer));
        let Some(ctx) = self.ctx.clone().filter(SessionContext::is_host) else {
            return;
        };

        self.clients.insert(peer);
        if let Some(heartbeat) = self.host_heartbeat.as_mut() {
            heartbeat.on_client_connected(peer, now);
        }
        let welcome = PlayerJoinedPayload {
            peer,
            host_id: ctx.local_id,
        };
        match Message::with_payload(MessageKind::PlayerJoined, ctx.local_id, self.sim_tick, &welcome)
        {
            Ok(message) => self.outbox.send_to_all(message),
            Err(e) => tracing::error!(peer, "failed to encode welcome: {e}"),
        }

        match self.host_coord.phase() {
            HostPhase::Lobby => {}
            HostPhase::AwaitingReady => {
                self.host_coord.add_client(peer);
                self.pending_initial_loads.insert(peer);
            }
            HostPhase::Running => {
                self.pending_initial_loads.insert(peer);
            }
        }
    }

    fn forget_peer(&mut self, peer: PeerId) {
        self.cursors.forget(&peer);
        let Some(ctx) = self.ctx.clone().filter(SessionContext::is_host) else {
            return;
        };
        self.clients.remove(&peer);
        if let Some(heartbeat) = self.host_heartbeat.as_mut() {
            heartbeat.on_client_disconnected(peer);
        }
        self.budget.forget(peer);
        self.pending_initial_loads.remove(&peer);
        if self
            .host_coord
            .on_peer_left(&ctx, peer, self.sim_tick, &mut self.outbox)
        {
            self.events.emit(SyncEvent::GameStarted);
        }
    }

    // -- Dispatch -------------------------------------------------------------

    fn handle_message<W: SyncWorld>(
        &mut self,
        peer: PeerId,
        message: Message,
        now: Instant,
        world: &mut W,
    ) -> Result<(), SyncError> {
        let Some(ctx) = self.ctx.clone() else {
            return self.handle_before_welcome(peer, &message);
        };

        if is_host_only(message.kind) && (ctx.is_host() || !ctx.is_from_host(peer)) {
            tracing::warn!(peer, kind = ?message.kind, "host-only message from non-host peer, ignoring");
            return Ok(());
        }
        if is_host_bound(message.kind) && !ctx.is_host() {
            tracing::warn!(peer, kind = ?message.kind, "host-bound message reached a client, ignoring");
            return Ok(());
        }

        match message.kind {
            MessageKind::Heartbeat => {
                if let Some(heartbeat) = self.client_heartbeat.as_mut() {
                    heartbeat.handle_heartbeat(&ctx, &message, now, &mut self.outbox)?;
                }
            }
            MessageKind::HeartbeatAck => {
                if let Some(heartbeat) = self.host_heartbeat.as_mut() {
                    heartbeat.handle_ack(peer, &message, now)?;
                }
            }
            MessageKind::SyncCheck => {
                let sample_count = self.config.continuous_sample_count;
                let mismatched = DriftDetector::handle_check(
                    &ctx,
                    &message,
                    |tick| world.checksums(tick, sample_count),
                    &mut self.outbox,
                )?;
                if !mismatched.is_empty() {
                    self.events.emit(SyncEvent::LocalDrift {
                        tick: message.tick,
                        mismatched,
                    });
                }
            }
            MessageKind::SyncResponse => self.handle_sync_response(&ctx, peer, &message, world)?,
            MessageKind::SyncCategoryData | MessageKind::SyncCategoryChunk => {
                if let Some(batch) = self.resync_rx.handle_message(&message)? {
                    let report = self
                        .applier
                        .apply_category_data(batch.category, &batch.compressed)?;
                    self.events.emit(SyncEvent::CategoryResynced {
                        category: batch.category,
                        incremental: batch.incremental,
                        report,
                    });
                }
            }
            MessageKind::Command | MessageKind::CommandBroadcast => {
                let outcome = self
                    .commands
                    .handle_message(&ctx, peer, &message, &mut self.outbox)?;
                self.report_command(outcome);
            }
            MessageKind::WorldData | MessageKind::ResyncWorldData => {
                let announcement = self.hard_sync_rx.handle_announcement(&message)?;
                if announcement.transfer.is_live_resync && !self.live_resync_paused {
                    self.outbox.send_to(
                        ctx.host_id,
                        ctx.message(MessageKind::SyncPauseRequest, self.sim_tick),
                    );
                    self.live_resync_paused = true;
                }
            }
            MessageKind::WorldDataChunk => self.handle_world_chunk(&ctx, &message, world)?,
            MessageKind::GameStarting => {
                self.client_coord.handle_game_starting();
                self.events.emit(SyncEvent::GameStarting);
            }
            MessageKind::GameStart => {
                self.client_coord.handle_game_start();
                self.events.emit(SyncEvent::GameStarted);
            }
            MessageKind::PlayerReady => {
                let outcome =
                    self.host_coord
                        .handle_player_ready(&ctx, peer, self.sim_tick, &mut self.outbox);
                if outcome != ReadyOutcome::Ignored {
                    self.events.emit(SyncEvent::PlayerReady(peer));
                }
                if outcome == ReadyOutcome::Started {
                    self.events.emit(SyncEvent::GameStarted);
                }
            }
            MessageKind::SyncPauseRequest => {
                self.events.emit(SyncEvent::SyncPauseRequested(peer));
            }
            MessageKind::SyncResumeRequest => {
                self.events.emit(SyncEvent::SyncResumeRequested(peer));
            }
            MessageKind::Ping => {
                let pong = Message::new(MessageKind::Pong, ctx.local_id, self.sim_tick, message.payload);
                self.outbox.send_to(peer, pong);
            }
            MessageKind::Pong => {
                let ping: PingPayload = message.payload_as()?;
                let round_trip = Duration::from_millis(self.millis(now).saturating_sub(ping.sent_ms));
                self.events.emit(SyncEvent::Pong { peer, round_trip });
            }
            MessageKind::CursorUpdate => {
                let update: CursorUpdate = message.payload_as()?;
                if self.cursors.accept(peer, update.timestamp_ms) {
                    self.events.emit(SyncEvent::CursorMoved { peer, update });
                } else {
                    tracing::trace!(peer, ts = update.timestamp_ms, "stale cursor update dropped");
                }
            }
            MessageKind::Error => {
                let text = message
                    .payload_as::<String>()
                    .unwrap_or_else(|_| String::from_utf8_lossy(&message.payload).into_owned());
                tracing::warn!(peer, %text, "peer reported an error");
                self.events.emit(SyncEvent::PeerError { peer, text });
            }
            MessageKind::LobbyUpdate
            | MessageKind::Pause
            | MessageKind::Unpause
            | MessageKind::SpeedChange
            | MessageKind::Chat
            | MessageKind::Disconnect
            | MessageKind::PlayerJoined
            | MessageKind::PlayerLeft
            | MessageKind::SystemMessage => {
                self.events.emit(SyncEvent::Received { peer, message });
            }
        }
        Ok(())
    }

    fn handle_before_welcome(&mut self, peer: PeerId, message: &Message) -> Result<(), SyncError> {
        if !self.joining || message.kind != MessageKind::PlayerJoined {
            tracing::debug!(peer, kind = ?message.kind, "no session yet, ignoring message");
            return Ok(());
        }
        let welcome: PlayerJoinedPayload = message.payload_as()?;
        let local_id = self.transport.local_id();
        if welcome.host_id != peer || welcome.peer != local_id {
            tracing::debug!(peer, "welcome not addressed to us, ignoring");
            return Ok(());
        }
        self.ctx = Some(SessionContext::client(local_id, peer));
        self.joining = false;
        tracing::info!(local_id, host_id = peer, "joined session");
        self.events.emit(SyncEvent::Connected { role: Role::Client });
        Ok(())
    }

    fn handle_sync_response<W: SyncWorld>(
        &mut self,
        ctx: &SessionContext,
        peer: PeerId,
        message: &Message,
        world: &W,
    ) -> Result<(), SyncError> {
        let (response, verdict) = self.budget.handle_response(peer, message)?;
        if !response.mismatched.is_empty() {
            self.events.emit(SyncEvent::DriftDetected {
                peer,
                tick: response.tick,
                mismatched: response.mismatched,
            });
        }
        if verdict.escalate {
            self.start_hard_sync(
                ctx,
                HardSyncReason::DriftBudgetExceeded,
                Destination::All,
                world,
            )?;
            return Ok(());
        }

        let limits = self.resync_limits();
        for category in verdict.resync.iter() {
            let records = world.category_records(category);
            send_category_data(
                ctx,
                Destination::Peer(peer),
                category,
                &records,
                false,
                self.sim_tick,
                limits,
                &mut self.outbox,
            )?;
        }
        Ok(())
    }

    fn handle_world_chunk<W: SyncWorld>(
        &mut self,
        ctx: &SessionContext,
        message: &Message,
        world: &mut W,
    ) -> Result<(), SyncError> {
        let received = match self.hard_sync_rx.handle_chunk(message) {
            Ok(Some(received)) => received,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.finish_live_resync(ctx);
                return Err(e.into());
            }
        };

        let snapshot = &received.snapshot;
        match self
            .hard_sync_rx
            .apply(&received, |path, blob| world.load_world(path, blob))
        {
            Ok(path) => {
                self.events.emit(SyncEvent::HardSyncApplied {
                    reason: snapshot.reason,
                    tick: snapshot.simulated_tick,
                    path,
                });
                if !received.transfer.is_live_resync {
                    self.client_coord
                        .world_loaded(ctx, self.sim_tick, &mut self.outbox);
                }
            }
            Err(e) => {
                tracing::error!(
                    reason = ?snapshot.reason,
                    tick = snapshot.simulated_tick,
                    bytes = snapshot.compressed_blob.len(),
                    "hard sync rejected, keeping current world: {e}"
                );
                self.events.emit(SyncEvent::HardSyncFailed {
                    error: e.to_string(),
                });
            }
        }
        self.finish_live_resync(ctx);
        Ok(())
    }

    fn finish_live_resync(&mut self, ctx: &SessionContext) {
        if self.live_resync_paused {
            self.outbox.send_to(
                ctx.host_id,
                ctx.message(MessageKind::SyncResumeRequest, self.sim_tick),
            );
            self.live_resync_paused = false;
        }
    }

    fn report_command(&mut self, outcome: CommandOutcome) {
        if let CommandOutcome::Rejected {
            tag,
            origin,
            reason,
        } = outcome
        {
            self.events.emit(SyncEvent::CommandRejected {
                tag,
                origin,
                reason,
            });
        }
    }

    // -- Timers ---------------------------------------------------------------

    fn run_timers<W: SyncWorld>(&mut self, now: Instant, world: &W) {
        match self.ctx.clone() {
            Some(ctx) if ctx.is_host() => self.run_host_timers(&ctx, now, world),
            _ => {
                if let Some(heartbeat) = self.client_heartbeat.as_mut()
                    && heartbeat.tick(now)
                {
                    self.events.emit(SyncEvent::HostDisconnected);
                }
            }
        }
    }

    fn run_host_timers<W: SyncWorld>(&mut self, ctx: &SessionContext, now: Instant, world: &W) {
        if let Some(heartbeat) = self.host_heartbeat.as_mut() {
            match heartbeat.tick(ctx, now, self.sim_tick, &mut self.outbox) {
                Ok(evicted) => {
                    for peer in evicted {
                        self.forget_peer(peer);
                        self.events.emit(SyncEvent::ClientTimedOut(peer));
                    }
                }
                Err(e) => tracing::error!("failed to encode heartbeat: {e}"),
            }
        }

        let running = self.host_coord.phase() == HostPhase::Running;
        if running && !self.clients.is_empty() && self.drift.due(now) {
            let checksums = world.checksums(self.sim_tick, self.config.continuous_sample_count);
            if let Err(e) = self
                .drift
                .perform_check(ctx, &checksums, now, &mut self.outbox)
            {
                tracing::error!(tick = self.sim_tick, "failed to encode sync check: {e}");
            }
        }

        if running
            && self.hard_sync.periodic_due(self.sim_tick)
            && !self.clients.is_empty()
            && let Err(e) = self.start_hard_sync(ctx, HardSyncReason::Periodic, Destination::All, world)
        {
            tracing::error!(tick = self.sim_tick, "periodic hard sync failed: {e}");
        }

        if !self.hard_sync.in_flight()
            && let Some(peer) = self.pending_initial_loads.pop_first()
        {
            match self.start_hard_sync(ctx, HardSyncReason::InitialLoad, Destination::Peer(peer), world) {
                Ok(true) => {}
                Ok(false) => {
                    self.pending_initial_loads.insert(peer);
                }
                Err(e) => tracing::error!(peer, "initial world transfer failed: {e}"),
            }
        }

        let changes = self.pending.drain();
        if !changes.is_empty() && !self.clients.is_empty() {
            let limits = self.resync_limits();
            for (category, records) in changes {
                if let Err(e) = send_category_data(
                    ctx,
                    Destination::All,
                    category,
                    &records,
                    true,
                    self.sim_tick,
                    limits,
                    &mut self.outbox,
                ) {
                    tracing::warn!(%category, records = records.len(), "failed to send delta: {e}");
                }
            }
        }

        self.hard_sync
            .poll_transmit(self.config.chunks_per_tick, &mut self.outbox);
    }

    fn start_hard_sync<W: SyncWorld>(
        &mut self,
        ctx: &SessionContext,
        reason: HardSyncReason,
        destination: Destination,
        world: &W,
    ) -> Result<bool, SyncError> {
        let started =
            self.hard_sync
                .trigger(ctx, reason, self.sim_tick, destination, || world.serialize_world())?;
        if started {
            if reason.is_live() {
                self.budget.reset();
            }
            self.events.emit(SyncEvent::HardSyncStarted { reason });
        }
        Ok(started)
    }

    fn resync_limits(&self) -> ResyncLimits {
        ResyncLimits {
            single_message_threshold: self.config.single_message_threshold_bytes,
            chunk_size: self.config.chunk_size_bytes,
        }
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn host_context(&self) -> Result<SessionContext, SyncError> {
        match &self.ctx {
            Some(ctx) if ctx.is_host() => Ok(ctx.clone()),
            Some(_) => Err(SyncError::NotHost),
            None => Err(SyncError::NotConnected),
        }
    }

    // -- Application API --------------------------------------------------------

    /// Host: announce the game, stream the world to every client, and wait
    /// for them. Messages go out on the next [`SyncEngine::update`].
    pub fn start_game<W: SyncWorld>(&mut self, world: &W) -> Result<(), SyncError> {
        let ctx = self.host_context()?;
        let clients: Vec<PeerId> = self.clients.iter().copied().collect();
        if self
            .host_coord
            .begin(&ctx, clients.iter().copied(), self.sim_tick, &mut self.outbox)?
        {
            self.events.emit(SyncEvent::GameStarted);
            return Ok(());
        }
        if !self.start_hard_sync(&ctx, HardSyncReason::InitialLoad, Destination::All, world)? {
            self.pending_initial_loads.extend(clients);
        }
        Ok(())
    }

    /// Host: push the whole world to every client now. Returns `false` if a
    /// hard sync is already in flight.
    pub fn trigger_hard_sync<W: SyncWorld>(&mut self, world: &W) -> Result<bool, SyncError> {
        let ctx = self.host_context()?;
        self.start_hard_sync(&ctx, HardSyncReason::Manual, Destination::All, world)
    }

    /// Submit a command through the host.
    pub fn send_command<C: Command>(&mut self, command: &C) -> Result<CommandOutcome, SyncError> {
        let ctx = self.ctx.clone().ok_or(SyncError::NotConnected)?;
        let outcome = self
            .commands
            .send_command(&ctx, command, self.sim_tick, &mut self.outbox)?;
        self.report_command(outcome.clone());
        Ok(outcome)
    }

    /// Broadcast a cursor position on the unreliable channel.
    pub fn send_cursor(&mut self, update: &CursorUpdate) -> Result<(), SyncError> {
        let ctx = self.ctx.clone().ok_or(SyncError::NotConnected)?;
        self.outbox.push(
            Destination::All,
            Message::with_payload(MessageKind::CursorUpdate, ctx.local_id, self.sim_tick, update)?,
            Reliability::Unreliable,
        );
        Ok(())
    }

    /// Send an application message the engine does not interpret (chat,
    /// pause, lobby updates, ...).
    pub fn send_message<P: Serialize>(
        &mut self,
        destination: Destination,
        kind: MessageKind,
        payload: &P,
    ) -> Result<(), SyncError> {
        let ctx = self.ctx.clone().ok_or(SyncError::NotConnected)?;
        self.outbox.push(
            destination,
            Message::with_payload(kind, ctx.local_id, self.sim_tick, payload)?,
            Reliability::ReliableOrdered,
        );
        Ok(())
    }

    /// Probe round-trip time to `peer`; answered by [`SyncEvent::Pong`].
    pub fn ping(&mut self, peer: PeerId, now: Instant) -> Result<(), SyncError> {
        let ping = PingPayload {
            sent_ms: self.millis(now),
        };
        self.send_message(Destination::Peer(peer), MessageKind::Ping, &ping)
    }

    /// Call `observer` for every future event. From then on events are no
    /// longer queued for [`drain_events`](Self::drain_events).
    pub fn subscribe(&mut self, observer: impl FnMut(&SyncEvent) + Send + 'static) {
        self.events.subscribe(observer);
    }

    /// Take every event queued since the last drain (at most
    /// [`MAX_QUEUED_EVENTS`](crate::event::MAX_QUEUED_EVENTS)).
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain()
    }

    /// Command handlers, validators, and request handlers.
    pub fn commands_mut(&mut self) -> &mut CommandRegistry {
        self.commands.registry_mut()
    }

    /// Per-category resync appliers.
    pub fn applier_mut(&mut self) -> &mut ResyncApplier {
        &mut self.applier
    }

    /// Handle for queuing incremental deltas from any thread.
    pub fn pending_changes(&self) -> PendingChanges {
        self.pending.clone()
    }

    /// Current session context, once established.
    pub fn context(&self) -> Option<&SessionContext> {
        self.ctx.as_ref()
    }

    /// Host: connected clients.
    pub fn clients(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.clients.iter().copied()
    }

    /// Host: consecutive mismatches reported by `peer`.
    pub fn drift_streak(&self, peer: PeerId) -> u32 {
        self.budget.streak(peer)
    }

    /// Host: hard-sync state.
    pub fn hard_sync_phase(&self) -> HardSyncPhase {
        self.hard_sync.phase()
    }

    /// Host: handshake state.
    pub fn host_phase(&self) -> HostPhase {
        self.host_coord.phase()
    }

    /// Client: handshake state.
    pub fn client_phase(&self) -> ClientPhase {
        self.client_coord.phase()
    }

    /// Host: last heartbeat round trip to `peer`.
    pub fn round_trip(&self, peer: PeerId) -> Option<Duration> {
        self.host_heartbeat.as_ref().and_then(|h| h.round_trip(peer))
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Kinds only the host may send.
fn is_host_only(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::GameStarting
            | MessageKind::WorldData
            | MessageKind::WorldDataChunk
            | MessageKind::GameStart
            | MessageKind::SyncCheck
            | MessageKind::SyncCategoryData
            | MessageKind::SyncCategoryChunk
            | MessageKind::Heartbeat
            | MessageKind::ResyncWorldData
    )
}

/// Kinds only the host may receive.
fn is_host_bound(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::SyncResponse
            | MessageKind::HeartbeatAck
            | MessageKind::PlayerReady
            | MessageKind::SyncPauseRequest
            | MessageKind::SyncResumeRequest
    )
}

/// Errors surfaced by the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The transport backend could not be initialized.
    #[error("transport backend unavailable")]
    TransportUnavailable,
    /// No session is established.
    #[error("not connected to a session")]
    NotConnected,
    /// The operation is reserved for the host.
    #[error("only the host can do this")]
    NotHost,
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The transport refused the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// A message could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Heartbeat handling failed.
    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),
    /// Answering a sync check failed.
    #[error(transparent)]
    Drift(#[from] DriftError),
    /// Command handling failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Partial resync failed.
    #[error(transparent)]
    Resync(#[from] ResyncError),
    /// Hard sync failed.
    #[error(transparent)]
    HardSync(#[from] HardSyncError),
    /// The game-start handshake failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}
