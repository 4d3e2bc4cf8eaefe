//! Load/save contract between the engine and a key-value store.
//!
//! Keyspace layout:
//! - `game:state`: JSON `{ "tick": n, "players": { token: { .. } } }`
//! - `grid:<x>:<y>`: JSON entity record with a `type` discriminator; absent
//!   for empty cells
//! - `grid-initialized`: `<width>x<height>`, present once a grid has been
//!   generated and saved. The grid keeps that size for the life of the store.
//!
//! A tick save writes all three in one [`WriteBatch`], which every store
//! applies atomically.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sim_runtime::StagedCommand;
use thiserror::Error;
use tracing::{info, warn};

use crate::directory::{DirectorySnapshot, PlayerId, PlayerRecord, Token};
use crate::engine::PersistedState;
use crate::world::{Entity, GridPos, WorldSnapshot};

pub const STATE_KEY: &str = "game:state";
pub const GRID_INITIALIZED_KEY: &str = "grid-initialized";
pub const CELL_KEY_PREFIX: &str = "grid:";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode store image: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode store image: {0}")]
    Decode(#[source] bincode::Error),
    #[error("corrupt record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unreadable grid-initialized record {0:?}, expected <width>x<height>")]
    BadGridRecord(String),
    /// The grid is fixed once generated; a differently sized world never
    /// overwrites it.
    #[error(
        "stored grid is {stored_width}x{stored_height} but {width}x{height} was requested"
    )]
    GridMismatch {
        stored_width: u32,
        stored_height: u32,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Ordered group of writes applied as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(self, entries: &mut BTreeMap<String, String>) {
        for op in self.ops {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
    }
}

/// Backing key-value engine. `apply` must be all-or-nothing.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PersistenceError>;
    fn apply(&mut self, batch: WriteBatch) -> Result<(), PersistenceError>;
    fn clear(&mut self) -> Result<(), PersistenceError>;
}

/// In-process store. Clones share the same keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().expect("memory store mutex poisoned")
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PersistenceError> {
        Ok(scan(&self.entries(), prefix))
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<(), PersistenceError> {
        batch.apply_to(&mut self.entries());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), PersistenceError> {
        self.entries().clear();
        Ok(())
    }
}

/// Single-file store. The whole keyspace is rewritten to a sibling temp file
/// and renamed into place, so a crash mid-save leaves the previous image.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = match File::open(&path) {
            Ok(file) => bincode::deserialize_from(BufReader::new(file))
                .map_err(PersistenceError::Decode)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        info!(
            target: "surge::persistence",
            path = %path.display(),
            keys = entries.len(),
            "store.opened"
        );
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_image(&self, entries: &BTreeMap<String, String>) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp).map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, entries).map_err(PersistenceError::Encode)?;
            writer.flush().map_err(io_err)?;
            writer.get_ref().sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PersistenceError> {
        Ok(scan(&self.entries, prefix))
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<(), PersistenceError> {
        let mut next = self.entries.clone();
        batch.apply_to(&mut next);
        self.write_image(&next)?;
        self.entries = next;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), PersistenceError> {
        let empty = BTreeMap::new();
        self.write_image(&empty)?;
        self.entries = empty;
        Ok(())
    }
}

fn scan(entries: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateRecord {
    tick: u64,
    #[serde(default)]
    players: BTreeMap<Token, StoredPlayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPlayer {
    id: PlayerId,
    name: String,
    /// Staged commands still waiting for a commit.
    #[serde(default)]
    commands: Vec<StagedCommand>,
    #[serde(default)]
    committed: Vec<StagedCommand>,
}

pub fn cell_key(pos: GridPos) -> String {
    format!("{}{}:{}", CELL_KEY_PREFIX, pos.x, pos.y)
}

pub fn parse_cell_key(key: &str) -> Option<GridPos> {
    let rest = key.strip_prefix(CELL_KEY_PREFIX)?;
    let (x, y) = rest.split_once(':')?;
    Some(GridPos::new(x.parse().ok()?, y.parse().ok()?))
}

fn parse_dimensions(raw: &str) -> Option<(u32, u32)> {
    let (width, height) = raw.split_once('x')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}

pub fn encode_entity(entity: &Entity) -> String {
    serde_json::to_string(entity).expect("entity records always serialise")
}

/// Persistence gateway: the only path between engine state and the store.
pub struct PersistenceGateway {
    store: Box<dyn KeyValueStore>,
}

impl PersistenceGateway {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn reset(&mut self) -> Result<(), PersistenceError> {
        warn!(target: "surge::persistence", "store.reset");
        self.store.clear()
    }

    fn load_state_record(&self) -> Result<Option<StateRecord>, PersistenceError> {
        match self.store.get(STATE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| PersistenceError::Corrupt {
                    key: STATE_KEY.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Dimensions recorded when the grid was first saved, if any.
    pub fn grid_dimensions(&self) -> Result<Option<(u32, u32)>, PersistenceError> {
        match self.store.get(GRID_INITIALIZED_KEY)? {
            Some(raw) => parse_dimensions(&raw)
                .map(Some)
                .ok_or(PersistenceError::BadGridRecord(raw)),
            None => Ok(None),
        }
    }

    /// `None` until a grid has been generated and saved. The grid comes back
    /// at its stored size. Unreadable cell records are logged and skipped; a
    /// corrupt state record is an error.
    pub fn load_world_snapshot(&self) -> Result<Option<WorldSnapshot>, PersistenceError> {
        let Some((width, height)) = self.grid_dimensions()? else {
            return Ok(None);
        };
        let tick = self.load_state_record()?.map(|s| s.tick).unwrap_or(0);

        let mut cells = Vec::new();
        for (key, raw) in self.store.scan_prefix(CELL_KEY_PREFIX)? {
            let Some(pos) = parse_cell_key(&key).filter(|p| p.x < width && p.y < height) else {
                warn!(target: "surge::persistence", %key, width, height, "load.skipped=bad_cell_key");
                continue;
            };
            match serde_json::from_str::<Entity>(&raw) {
                Ok(entity) => cells.push((pos, entity)),
                Err(err) => {
                    warn!(target: "surge::persistence", %key, %err, "load.skipped=bad_cell_record")
                }
            }
        }
        cells.sort_by_key(|(pos, _)| (pos.y, pos.x));

        Ok(Some(WorldSnapshot {
            tick,
            width,
            height,
            cells,
        }))
    }

    /// Players come back in registration order.
    pub fn load_player_directory(&self) -> Result<Option<DirectorySnapshot>, PersistenceError> {
        let Some(state) = self.load_state_record()? else {
            return Ok(None);
        };
        let mut players: Vec<PlayerRecord> = state
            .players
            .into_iter()
            .map(|(token, stored)| PlayerRecord {
                id: stored.id,
                token,
                name: stored.name,
                staged: stored.commands,
                committed: stored.committed,
            })
            .collect();
        players.sort_by_key(|record| record.id);
        Ok(Some(DirectorySnapshot { players }))
    }

    /// Save grid and tick, keeping whatever players are already stored.
    pub fn save_world_snapshot(&mut self, world: &WorldSnapshot) -> Result<(), PersistenceError> {
        let mut state = self.load_state_record()?.unwrap_or_default();
        state.tick = world.tick;
        let mut batch = WriteBatch::new();
        self.stage_world(&mut batch, world)?;
        stage_state(&mut batch, &state);
        self.store.apply(batch)
    }

    /// Save the directory, keeping whatever tick is already stored.
    pub fn save_player_directory(
        &mut self,
        directory: &DirectorySnapshot,
    ) -> Result<(), PersistenceError> {
        let tick = self.load_state_record()?.map(|s| s.tick).unwrap_or(0);
        let mut batch = WriteBatch::new();
        stage_state(&mut batch, &state_record(tick, directory));
        self.store.apply(batch)
    }

    /// Save world and directory as one atomic batch.
    pub fn save(&mut self, state: &PersistedState) -> Result<(), PersistenceError> {
        let mut batch = WriteBatch::new();
        self.stage_world(&mut batch, &state.world)?;
        stage_state(&mut batch, &state_record(state.world.tick, &state.directory));
        self.store.apply(batch)
    }

    fn stage_world(
        &self,
        batch: &mut WriteBatch,
        world: &WorldSnapshot,
    ) -> Result<(), PersistenceError> {
        if let Some((stored_width, stored_height)) = self.grid_dimensions()? {
            if (stored_width, stored_height) != (world.width, world.height) {
                return Err(PersistenceError::GridMismatch {
                    stored_width,
                    stored_height,
                    width: world.width,
                    height: world.height,
                });
            }
        }
        let mut stale: BTreeMap<String, String> = self
            .store
            .scan_prefix(CELL_KEY_PREFIX)?
            .into_iter()
            .collect();
        for (pos, entity) in &world.cells {
            let key = cell_key(*pos);
            let value = encode_entity(entity);
            if stale.remove(&key).as_deref() != Some(value.as_str()) {
                batch.put(key, value);
            }
        }
        for key in stale.into_keys() {
            batch.delete(key);
        }
        batch.put(
            GRID_INITIALIZED_KEY,
            format!("{}x{}", world.width, world.height),
        );
        Ok(())
    }
}

fn state_record(tick: u64, directory: &DirectorySnapshot) -> StateRecord {
    StateRecord {
        tick,
        players: directory
            .players
            .iter()
            .map(|record| {
                (
                    record.token.clone(),
                    StoredPlayer {
                        id: record.id,
                        name: record.name.clone(),
                        commands: record.staged.clone(),
                        committed: record.committed.clone(),
                    },
                )
            })
            .collect(),
    }
}

fn stage_state(batch: &mut WriteBatch, state: &StateRecord) {
    let json = serde_json::to_string(state).expect("state record always serialises");
    batch.put(STATE_KEY, json);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{PowerLink, PowerNode, Robot, Spawn};

    fn sample_world(tick: u64) -> WorldSnapshot {
        WorldSnapshot {
            tick,
            width: 4,
            height: 4,
            cells: vec![
                (
                    GridPos::new(1, 0),
                    Entity::Spawn(Spawn {
                        cooldown_until: 0,
                        cooldown_amount: 10,
                        energy_required: 50,
                    }),
                ),
                (
                    GridPos::new(3, 1),
                    Entity::PowerNode(PowerNode {
                        energy_per_tick: 10,
                    }),
                ),
                (
                    GridPos::new(0, 2),
                    Entity::PowerLink(PowerLink {
                        built_by: Token::from("TKA"),
                        health: 7,
                    }),
                ),
                (
                    GridPos::new(2, 3),
                    Entity::Robot(Robot {
                        owner: Token::from("TKA"),
                        health: 100,
                        energy: 50,
                        queued_action: "MOVE 1 1".to_string(),
                    }),
                ),
            ],
        }
    }

    fn sample_directory() -> DirectorySnapshot {
        DirectorySnapshot {
            players: vec![PlayerRecord {
                id: PlayerId(0),
                token: Token::from("TKA"),
                name: "ada".to_string(),
                staged: vec![StagedCommand::new("HARVEST", Vec::new())],
                committed: vec![StagedCommand::new(
                    "MOVE",
                    vec!["1".to_string(), "1".to_string()],
                )],
            }],
        }
    }

    #[test]
    fn cell_records_carry_type_discriminator() {
        let robot = &sample_world(0).cells[3].1;
        insta::assert_snapshot!(
            encode_entity(robot),
            @r#"{"type":"robot","owner":"TKA","health":100,"energy":50,"queued_action":"MOVE 1 1"}"#
        );
        let node = &sample_world(0).cells[1].1;
        insta::assert_snapshot!(
            encode_entity(node),
            @r#"{"type":"power_node","energy_produced_per_tick":10}"#
        );
    }

    #[test]
    fn cell_keys_round_trip() {
        assert_eq!(cell_key(GridPos::new(12, 7)), "grid:12:7");
        assert_eq!(parse_cell_key("grid:12:7"), Some(GridPos::new(12, 7)));
        assert_eq!(parse_cell_key("grid:12"), None);
        assert_eq!(parse_cell_key("grid-initialized"), None);
    }

    #[test]
    fn fresh_store_has_nothing_to_load() {
        let gateway = PersistenceGateway::new(Box::new(MemoryStore::new()));
        assert!(gateway.load_world_snapshot().unwrap().is_none());
        assert!(gateway.load_player_directory().unwrap().is_none());
    }

    #[test]
    fn save_then_load_is_lossless() {
        let mut gateway = PersistenceGateway::new(Box::new(MemoryStore::new()));
        let state = PersistedState {
            world: sample_world(9),
            directory: sample_directory(),
        };
        gateway.save(&state).unwrap();

        let world = gateway.load_world_snapshot().unwrap().unwrap();
        let directory = gateway.load_player_directory().unwrap().unwrap();
        assert_eq!(world, state.world);
        assert_eq!(directory, state.directory);
    }

    #[test]
    fn emptied_cells_are_deleted_and_unchanged_cells_skipped() {
        let store = MemoryStore::new();
        let mut gateway = PersistenceGateway::new(Box::new(store.clone()));
        gateway.save_world_snapshot(&sample_world(1)).unwrap();
        assert_eq!(store.len(), 6);

        let mut world = sample_world(2);
        world.cells.remove(0);
        let mut batch = WriteBatch::new();
        gateway.stage_world(&mut batch, &world).unwrap();
        assert_eq!(batch.len(), 2, "one delete plus the initialised flag");

        gateway.save_world_snapshot(&world).unwrap();
        assert!(store.get("grid:1:0").unwrap().is_none());
        assert_eq!(gateway.load_world_snapshot().unwrap().unwrap(), world);
    }

    #[test]
    fn partial_saves_preserve_the_other_half() {
        let mut gateway = PersistenceGateway::new(Box::new(MemoryStore::new()));
        gateway.save_player_directory(&sample_directory()).unwrap();
        gateway.save_world_snapshot(&sample_world(5)).unwrap();
        assert_eq!(
            gateway.load_player_directory().unwrap().unwrap(),
            sample_directory()
        );
        gateway
            .save_player_directory(&DirectorySnapshot::default())
            .unwrap();
        assert_eq!(gateway.load_world_snapshot().unwrap().unwrap().tick, 5);
    }

    #[test]
    fn corrupt_state_record_is_an_error() {
        let mut store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(STATE_KEY, "{not json");
        batch.put(GRID_INITIALIZED_KEY, "4x4");
        store.apply(batch).unwrap();
        let gateway = PersistenceGateway::new(Box::new(store));
        assert!(matches!(
            gateway.load_player_directory(),
            Err(PersistenceError::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_cell_records_are_skipped() {
        let mut store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(GRID_INITIALIZED_KEY, "4x4");
        batch.put("grid:0:0", r#"{"type":"volcano"}"#);
        batch.put("grid:1:1", encode_entity(&sample_world(0).cells[1].1));
        store.apply(batch).unwrap();
        let gateway = PersistenceGateway::new(Box::new(store));
        let world = gateway.load_world_snapshot().unwrap().unwrap();
        assert_eq!(world.cells.len(), 1);
        assert_eq!(world.tick, 0);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("world.bin");
        let state = PersistedState {
            world: sample_world(3),
            directory: sample_directory(),
        };
        {
            let mut gateway = PersistenceGateway::new(Box::new(FileStore::open(&path).unwrap()));
            gateway.save(&state).unwrap();
        }
        let gateway = PersistenceGateway::new(Box::new(FileStore::open(&path).unwrap()));
        assert_eq!(gateway.load_world_snapshot().unwrap().unwrap(), state.world);
        assert_eq!(
            gateway.load_player_directory().unwrap().unwrap(),
            state.directory
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn grid_size_is_recorded_and_reloaded() {
        let store = MemoryStore::new();
        let mut gateway = PersistenceGateway::new(Box::new(store.clone()));
        gateway.save_world_snapshot(&sample_world(1)).unwrap();
        assert_eq!(store.get(GRID_INITIALIZED_KEY).unwrap().as_deref(), Some("4x4"));
        assert_eq!(gateway.grid_dimensions().unwrap(), Some((4, 4)));

        let world = gateway.load_world_snapshot().unwrap().unwrap();
        assert_eq!((world.width, world.height), (4, 4));
    }

    #[test]
    fn differently_sized_save_is_refused_and_keeps_cells() {
        let store = MemoryStore::new();
        let mut gateway = PersistenceGateway::new(Box::new(store.clone()));
        gateway.save_world_snapshot(&sample_world(1)).unwrap();
        let before = store.scan_prefix("").unwrap();

        let mut shrunk = sample_world(2);
        shrunk.width = 2;
        shrunk.height = 2;
        shrunk.cells.retain(|(pos, _)| pos.x < 2 && pos.y < 2);
        let err = gateway.save_world_snapshot(&shrunk).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::GridMismatch {
                stored_width: 4,
                stored_height: 4,
                width: 2,
                height: 2,
            }
        ));
        assert_eq!(store.scan_prefix("").unwrap(), before);
    }

    #[test]
    fn unreadable_grid_record_is_an_error() {
        let mut store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(GRID_INITIALIZED_KEY, "1");
        store.apply(batch).unwrap();
        let gateway = PersistenceGateway::new(Box::new(store));
        assert!(matches!(
            gateway.load_world_snapshot(),
            Err(PersistenceError::BadGridRecord(raw)) if raw == "1"
        ));
    }

    #[test]
    fn cells_outside_the_stored_grid_are_skipped() {
        let mut store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(GRID_INITIALIZED_KEY, "2x2");
        batch.put("grid:1:1", encode_entity(&sample_world(0).cells[1].1));
        batch.put("grid:3:0", encode_entity(&sample_world(0).cells[1].1));
        store.apply(batch).unwrap();
        let gateway = PersistenceGateway::new(Box::new(store));
        let world = gateway.load_world_snapshot().unwrap().unwrap();
        assert_eq!(world.cells.len(), 1);
        assert_eq!(world.cells[0].0, GridPos::new(1, 1));
    }

    #[test]
    fn reset_clears_everything() {
        let store = MemoryStore::new();
        let mut gateway = PersistenceGateway::new(Box::new(store.clone()));
        gateway
            .save(&PersistedState {
                world: sample_world(1),
                directory: sample_directory(),
            })
            .unwrap();
        gateway.reset().unwrap();
        assert!(store.is_empty());
        assert!(gateway.load_world_snapshot().unwrap().is_none());
    }
}
