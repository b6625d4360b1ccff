//! Session lifecycle over the loopback transport: welcome, game-start
//! handshake, late joiners, heartbeat liveness, and the control traffic the
//! engine answers on its own.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{MAP_CATEGORIES, Session, count};
use tether_net::{Destination, MessageKind, Role};
use tether_sync::{ClientPhase, CursorUpdate, HardSyncReason, HostPhase, SyncError, SyncEvent};

#[test]
fn test_client_learns_host_from_welcome() {
    let mut session = Session::new(2);
    let host_id = session.host.context().unwrap().local_id;

    for index in 0..2 {
        let ctx = session.clients[index].engine.context().unwrap().clone();
        assert_eq!(ctx.role, Role::Client);
        assert_eq!(ctx.host_id, host_id);
        assert_eq!(ctx.local_id, session.client_id(index));
        let events = session.client_events(index);
        assert_eq!(
            count(&events, |e| *e == SyncEvent::Connected { role: Role::Client }),
            1
        );
    }

    let mut clients: Vec<_> = session.host.clients().collect();
    clients.sort_unstable();
    assert_eq!(clients, vec![session.client_id(0), session.client_id(1)]);
}

#[test]
fn test_game_start_handshake_waits_for_every_client() {
    let mut session = Session::new(2);
    session.drain_all_events();

    session.host.start_game(&session.host_world).unwrap();
    assert_eq!(session.host.host_phase(), HostPhase::AwaitingReady);
    session.run(10);

    assert_eq!(session.host.host_phase(), HostPhase::Running);
    let host_events = session.host_events();
    assert_eq!(count(&host_events, |e| matches!(e, SyncEvent::PlayerReady(_))), 2);
    assert_eq!(count(&host_events, |e| *e == SyncEvent::GameStarted), 1);
    assert_eq!(
        count(&host_events, |e| *e == SyncEvent::HardSyncStarted {
            reason: HardSyncReason::InitialLoad
        }),
        1
    );

    let host_state = session.host_world.snapshot();
    for index in 0..2 {
        assert_eq!(session.clients[index].engine.client_phase(), ClientPhase::Running);
        assert_eq!(session.clients[index].world.loads.len(), 1);
        assert_eq!(session.clients[index].world.snapshot(), host_state);

        let events = session.client_events(index);
        assert_eq!(count(&events, |e| *e == SyncEvent::GameStarting), 1);
        assert_eq!(count(&events, |e| *e == SyncEvent::GameStarted), 1);
        // An initial load is not a live resync: no pause requested.
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::HardSyncApplied {
                reason: HardSyncReason::InitialLoad,
                ..
            }
        )));
    }
    assert_eq!(
        count(&host_events, |e| matches!(e, SyncEvent::SyncPauseRequested(_))),
        0
    );
}

#[test]
fn test_host_alone_starts_immediately() {
    let mut session = Session::new(0);
    session.drain_all_events();
    session.host.start_game(&session.host_world).unwrap();
    assert_eq!(session.host.host_phase(), HostPhase::Running);
    assert_eq!(session.host_events(), vec![SyncEvent::GameStarted]);
}

#[test]
fn test_client_cannot_start_game() {
    let mut session = Session::new(1);
    let peer = &mut session.clients[0];
    assert!(matches!(
        peer.engine.start_game(&peer.world),
        Err(SyncError::NotHost)
    ));
    assert!(matches!(
        peer.engine.trigger_hard_sync(&peer.world),
        Err(SyncError::NotHost)
    ));
}

#[test]
fn test_late_joiner_gets_world_and_own_start() {
    let mut session = Session::new(1);
    session.start_game();
    session.host_world.lock().structures.insert(99, 990);
    session.drain_all_events();

    let late = session.add_client(&MAP_CATEGORIES);
    session.run(10);

    let peer = &session.clients[late];
    assert_eq!(peer.engine.client_phase(), ClientPhase::Running);
    assert_eq!(peer.world.snapshot(), session.host_world.snapshot());

    let host_events = session.host_events();
    let late_id = session.client_id(late);
    assert!(host_events.contains(&SyncEvent::PlayerReady(late_id)));
    assert_eq!(
        count(&host_events, |e| *e == SyncEvent::HardSyncStarted {
            reason: HardSyncReason::InitialLoad
        }),
        1
    );
    // The first client is not reloaded.
    assert_eq!(session.clients[0].world.loads.len(), 1);
}

#[test]
fn test_client_detects_silent_host_exactly_once() {
    let mut session = Session::new(1);
    session.drain_all_events();

    // Host frozen: no heartbeats for 11 s.
    for _ in 0..11 {
        session.advance_clients_only(Duration::from_secs(1));
    }
    let events = session.client_events(0);
    assert_eq!(count(&events, |e| *e == SyncEvent::HostDisconnected), 1);

    for _ in 0..30 {
        session.advance_clients_only(Duration::from_secs(1));
    }
    assert_eq!(
        count(&session.client_events(0), |e| *e == SyncEvent::HostDisconnected),
        0
    );
}

#[test]
fn test_heartbeats_keep_session_alive() {
    let mut session = Session::new(1);
    session.drain_all_events();

    for _ in 0..60 {
        session.advance(Duration::from_secs(1));
    }
    assert!(!session.client_events(0).contains(&SyncEvent::HostDisconnected));
    assert!(
        !session
            .host_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::ClientTimedOut(_)))
    );
    assert!(session.host.round_trip(session.client_id(0)).is_some());
}

#[test]
fn test_host_evicts_silent_client() {
    let mut session = Session::new(1);
    session.drain_all_events();
    let client = session.client_id(0);

    for _ in 0..12 {
        session.advance_host_only(Duration::from_secs(1));
    }
    let events = session.host_events();
    assert_eq!(count(&events, |e| *e == SyncEvent::ClientTimedOut(client)), 1);
    assert_eq!(session.host.clients().count(), 0);
}

#[test]
fn test_host_disconnect_reaches_clients() {
    let mut session = Session::new(1);
    session.drain_all_events();

    session.host.disconnect();
    assert!(session.host.context().is_none());
    session.advance_clients_only(Duration::from_millis(100));

    let events = session.client_events(0);
    assert!(events.contains(&SyncEvent::Disconnected));
    assert!(session.clients[0].engine.context().is_none());
}

#[test]
fn test_ping_is_answered_with_pong() {
    let mut session = Session::new(1);
    session.drain_all_events();
    let client = session.client_id(0);

    session.host.ping(client, session.now).unwrap();
    session.run(3);

    let events = session.host_events();
    assert_eq!(
        count(&events, |e| matches!(e, SyncEvent::Pong { peer, .. } if *peer == client)),
        1
    );
}

#[test]
fn test_stale_cursor_updates_are_dropped() {
    let mut session = Session::new(1);
    session.drain_all_events();
    let client = session.client_id(0);

    let newer = CursorUpdate {
        timestamp_ms: 50,
        x: 4.0,
        y: 2.0,
    };
    let older = CursorUpdate {
        timestamp_ms: 40,
        x: 1.0,
        y: 1.0,
    };
    session.clients[0].engine.send_cursor(&newer).unwrap();
    session.clients[0].engine.send_cursor(&older).unwrap();
    session.run(2);

    let moved: Vec<_> = session
        .host_events()
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::CursorMoved { peer, update } => Some((peer, update)),
            _ => None,
        })
        .collect();
    assert_eq!(moved, vec![(client, newer)]);
}

#[test]
fn test_unreliable_cursor_loss_is_tolerated() {
    let mut session = Session::new(1);
    session.drain_all_events();
    session.hub.set_drop_unreliable(true);

    let update = CursorUpdate {
        timestamp_ms: 1,
        x: 0.0,
        y: 0.0,
    };
    session.clients[0].engine.send_cursor(&update).unwrap();
    session.run(2);
    assert!(
        !session
            .host_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::CursorMoved { .. }))
    );
}

#[test]
fn test_application_traffic_passes_through() {
    let mut session = Session::new(1);
    session.drain_all_events();
    let client = session.client_id(0);

    session.clients[0]
        .engine
        .send_message(Destination::All, MessageKind::Chat, &"gg")
        .unwrap();
    session.run(2);

    let received: Vec<_> = session
        .host_events()
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::Received { peer, message } => Some((peer, message)),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, client);
    assert_eq!(received[0].1.kind, MessageKind::Chat);
    assert_eq!(received[0].1.payload_as::<String>().unwrap(), "gg");
}

#[test]
fn test_peer_error_is_surfaced() {
    let mut session = Session::new(1);
    session.drain_all_events();
    let client = session.client_id(0);

    session.clients[0]
        .engine
        .send_message(Destination::All, MessageKind::Error, &"save incompatible")
        .unwrap();
    session.run(2);
    assert!(session.host_events().contains(&SyncEvent::PeerError {
        peer: client,
        text: "save incompatible".to_string(),
    }));
}

#[test]
fn test_client_cannot_impersonate_host_control_traffic() {
    let mut session = Session::new(2);
    session.drain_all_events();

    // Client 1 tries to start client 0's game.
    let target = session.client_id(0);
    session.clients[1]
        .engine
        .send_message(Destination::Peer(target), MessageKind::GameStarting, &())
        .unwrap();
    session.run(2);

    assert_eq!(session.clients[0].engine.client_phase(), ClientPhase::Lobby);
    assert!(!session.client_events(0).contains(&SyncEvent::GameStarting));
}

#[test]
fn test_subscriber_receives_events_instead_of_queue() {
    let mut session = Session::new(1);
    session.drain_all_events();
    let client = session.client_id(0);

    let seen: Arc<Mutex<Vec<SyncEvent>>> = Arc::default();
    let sink = seen.clone();
    session
        .host
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    for _ in 0..20 {
        session.host.ping(client, session.now).unwrap();
        session.step();
    }

    assert!(session.host_events().is_empty());
    let pongs = count(&seen.lock().unwrap(), |e| matches!(e, SyncEvent::Pong { .. }));
    assert!(pongs >= 19, "only {pongs} pongs observed");
}
