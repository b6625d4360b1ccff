//! Host/client harness over the loopback transport.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tether_config::SyncConfig;
use tether_net::{LoopbackHub, LoopbackTransport, PeerId, Transport};
use tether_sync::{
    CategoryChecksum, CategoryRecord, ChecksumSet, SyncCategory, SyncEngine, SyncEvent, SyncWorld,
    checksum_elements, checksum_sampled,
};

/// Categories backed by id -> value maps.
pub const MAP_CATEGORIES: [SyncCategory; 3] = [
    SyncCategory::LooseItems,
    SyncCategory::Structures,
    SyncCategory::MobileEntities,
];

/// Every category the test world checksums.
pub const ALL_CATEGORIES: [SyncCategory; 4] = [
    SyncCategory::LooseItems,
    SyncCategory::Structures,
    SyncCategory::MobileEntities,
    SyncCategory::Gases,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub loose_items: BTreeMap<u64, i64>,
    pub structures: BTreeMap<u64, i64>,
    pub entities: BTreeMap<u64, i64>,
    pub gases: Vec<i64>,
}

impl WorldState {
    pub fn seeded() -> Self {
        Self {
            loose_items: (1..=3).map(|id| (id, id as i64 * 3)).collect(),
            structures: (1..=20).map(|id| (id, id as i64 * 10)).collect(),
            entities: (1..=5).map(|id| (id, id as i64 * 7)).collect(),
            gases: (0..256).map(|cell| cell % 17).collect(),
        }
    }

    pub fn map_mut(&mut self, category: SyncCategory) -> &mut BTreeMap<u64, i64> {
        match category {
            SyncCategory::LooseItems => &mut self.loose_items,
            SyncCategory::Structures => &mut self.structures,
            SyncCategory::MobileEntities => &mut self.entities,
            other => panic!("{other} is not a map category"),
        }
    }

    pub fn map(&self, category: SyncCategory) -> &BTreeMap<u64, i64> {
        match category {
            SyncCategory::LooseItems => &self.loose_items,
            SyncCategory::Structures => &self.structures,
            SyncCategory::MobileEntities => &self.entities,
            other => panic!("{other} is not a map category"),
        }
    }
}

fn map_checksum(map: &BTreeMap<u64, i64>) -> CategoryChecksum {
    let entries: Vec<(u64, i64)> = map.iter().map(|(id, value)| (*id, *value)).collect();
    checksum_elements(&entries)
}

/// A world whose state is shared with the resync appliers.
#[derive(Debug, Default)]
pub struct TestWorld {
    pub state: Arc<Mutex<WorldState>>,
    pub loads: Vec<PathBuf>,
}

impl TestWorld {
    pub fn seeded() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorldState::seeded())),
            loads: Vec::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap()
    }

    pub fn snapshot(&self) -> WorldState {
        self.lock().clone()
    }

    /// Apply received records of `categories` to this world.
    pub fn register_appliers(
        &self,
        engine: &mut SyncEngine<LoopbackTransport>,
        categories: &[SyncCategory],
    ) {
        for &category in categories {
            let state = self.state.clone();
            engine.applier_mut().register(category, move |record| {
                let mut state = state.lock().unwrap();
                if category == SyncCategory::Gases {
                    let value = record.attributes.get("value").and_then(serde_json::Value::as_i64);
                    let cell = state.gases.get_mut(record.id as usize);
                    return match (cell, value) {
                        (Some(cell), Some(value)) => {
                            *cell = value;
                            Ok(())
                        }
                        _ => Err(format!("bad gas record {}", record.id)),
                    };
                }
                let map = state.map_mut(category);
                if record.removed {
                    map.remove(&record.id);
                    return Ok(());
                }
                let value = record
                    .attributes
                    .get("value")
                    .and_then(serde_json::Value::as_i64)
                    .ok_or_else(|| format!("record {} has no value", record.id))?;
                map.insert(record.id, value);
                Ok(())
            });
        }
    }
}

impl SyncWorld for TestWorld {
    fn checksums(&self, tick: i64, sample_count: usize) -> ChecksumSet {
        let state = self.lock();
        ChecksumSet::new(tick)
            .with(SyncCategory::LooseItems, map_checksum(&state.loose_items))
            .with(SyncCategory::Structures, map_checksum(&state.structures))
            .with(SyncCategory::MobileEntities, map_checksum(&state.entities))
            .with(
                SyncCategory::Gases,
                checksum_sampled(tick, &state.gases, sample_count),
            )
    }

    fn category_records(&self, category: SyncCategory) -> Vec<CategoryRecord> {
        if category == SyncCategory::Gases {
            return self
                .lock()
                .gases
                .iter()
                .enumerate()
                .map(|(cell, value)| CategoryRecord::new(cell as u64).with("value", *value))
                .collect();
        }
        if !MAP_CATEGORIES.contains(&category) {
            return Vec::new();
        }
        self.lock()
            .map(category)
            .iter()
            .map(|(id, value)| CategoryRecord::new(*id).with("value", *value))
            .collect()
    }

    fn serialize_world(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&*self.lock()).map_err(|e| e.to_string())
    }

    fn load_world(&mut self, path: &Path, blob: &[u8]) -> Result<(), String> {
        let state: WorldState = serde_json::from_slice(blob).map_err(|e| e.to_string())?;
        *self.lock() = state;
        self.loads.push(path.to_path_buf());
        Ok(())
    }
}

pub struct Peer {
    pub engine: SyncEngine<LoopbackTransport>,
    pub world: TestWorld,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.engine.transport().local_id()
    }
}

/// Config with small chunks and no periodic hard sync.
pub fn test_config(snapshot_dir: &Path) -> SyncConfig {
    SyncConfig {
        chunk_size_bytes: 1_024,
        single_message_threshold_bytes: 1_024,
        chunks_per_tick: 8,
        hard_sync_interval_ticks: 0,
        snapshot_dir: snapshot_dir.to_path_buf(),
        ..SyncConfig::default()
    }
}

/// One host and any number of clients sharing a loopback hub.
pub struct Session {
    pub hub: LoopbackHub,
    pub config: SyncConfig,
    pub token: String,
    pub host: SyncEngine<LoopbackTransport>,
    pub host_world: TestWorld,
    pub clients: Vec<Peer>,
    pub now: Instant,
    pub tick: i64,
    _snapshots: TempDir,
}

impl Session {
    pub fn new(clients: usize) -> Self {
        Self::with_config(clients, |_| {})
    }

    /// Host plus `clients` joined clients with every applier registered.
    /// Welcomes and the first heartbeat exchange have completed on return.
    pub fn with_config(clients: usize, tweak: impl FnOnce(&mut SyncConfig)) -> Self {
        let snapshots = tempfile::tempdir().unwrap();
        let mut config = test_config(snapshots.path());
        tweak(&mut config);

        let hub = LoopbackHub::new();
        let now = Instant::now();
        let mut host = SyncEngine::new(hub.endpoint(), config.clone(), now).unwrap();
        let token = host.host(8, now).unwrap();

        let mut session = Self {
            hub,
            config,
            token,
            host,
            host_world: TestWorld::seeded(),
            clients: Vec::new(),
            now,
            tick: 0,
            _snapshots: snapshots,
        };
        for _ in 0..clients {
            session.add_client(&ALL_CATEGORIES);
        }
        session.run(2);
        session
    }

    /// Join a new client applying `categories`. Returns its index.
    pub fn add_client(&mut self, categories: &[SyncCategory]) -> usize {
        let world = TestWorld::seeded();
        let mut engine = SyncEngine::new(self.hub.endpoint(), self.config.clone(), self.now).unwrap();
        world.register_appliers(&mut engine, categories);
        engine.join(&self.token, self.now).unwrap();
        self.clients.push(Peer { engine, world });
        self.clients.len() - 1
    }

    pub fn client_id(&self, index: usize) -> PeerId {
        self.clients[index].id()
    }

    /// Advance 100 ms and one tick.
    pub fn step(&mut self) {
        self.advance(Duration::from_millis(100));
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Host first, then every client.
    pub fn advance(&mut self, dt: Duration) {
        self.now += dt;
        self.tick += 1;
        self.host.update(self.now, self.tick, &mut self.host_world);
        for peer in &mut self.clients {
            peer.engine.update(self.now, self.tick, &mut peer.world);
        }
    }

    /// Only clients run; the host is frozen.
    pub fn advance_clients_only(&mut self, dt: Duration) {
        self.now += dt;
        self.tick += 1;
        for peer in &mut self.clients {
            peer.engine.update(self.now, self.tick, &mut peer.world);
        }
    }

    /// Only the host runs; clients are frozen.
    pub fn advance_host_only(&mut self, dt: Duration) {
        self.now += dt;
        self.tick += 1;
        self.host.update(self.now, self.tick, &mut self.host_world);
    }

    /// Start the game and run until every client is loaded and running.
    pub fn start_game(&mut self) {
        self.host.start_game(&self.host_world).unwrap();
        self.run(10);
    }

    pub fn host_events(&mut self) -> Vec<SyncEvent> {
        self.host.drain_events()
    }

    pub fn client_events(&mut self, index: usize) -> Vec<SyncEvent> {
        self.clients[index].engine.drain_events()
    }

    pub fn drain_all_events(&mut self) {
        self.host.drain_events();
        for peer in &mut self.clients {
            peer.engine.drain_events();
        }
    }
}

pub fn count(events: &[SyncEvent], predicate: impl Fn(&SyncEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}
