use std::sync::{Mutex, MutexGuard};

use sim_runtime::StagedCommand;
use tracing::info;

use crate::config::RobotDefaults;
use crate::directory::{DirectoryError, DirectorySnapshot, PlayerDirectory, PlayerId, Token};
use crate::resolver::{self, TickReport};
use crate::world::{Cell, GridPos, WorldError, WorldSnapshot, WorldState};

/// Everything a tick save needs, captured under one lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState {
    pub world: WorldSnapshot,
    pub directory: DirectorySnapshot,
}

struct EngineState {
    world: WorldState,
    directory: PlayerDirectory,
}

/// Owner of the player directory and world state.
///
/// Directory and world sit behind one mutex because registration mutates
/// both. Callers never see the lock; every operation takes it briefly and
/// none of them performs I/O while holding it.
pub struct Engine {
    state: Mutex<EngineState>,
    robot: RobotDefaults,
}

impl Engine {
    pub fn new(world: WorldState, directory: PlayerDirectory, robot: RobotDefaults) -> Self {
        Self {
            state: Mutex::new(EngineState { world, directory }),
            robot,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state mutex poisoned")
    }

    pub fn issue_token(&self) -> Token {
        self.lock().directory.issue_token()
    }

    pub fn register(&self, token: Token, name: &str) -> Result<(PlayerId, GridPos), DirectoryError> {
        let redacted = token.redacted().to_string();
        let (id, pos) = {
            let mut guard = self.lock();
            let EngineState { world, directory } = &mut *guard;
            directory.register(token, name, world, &self.robot)?
        };
        info!(
            target: "surge::intake",
            player = %id,
            token = %redacted,
            name,
            %pos,
            "player.registered"
        );
        Ok((id, pos))
    }

    pub fn stage(&self, token: &str, command: StagedCommand) -> Result<usize, DirectoryError> {
        self.lock().directory.stage(token, command)
    }

    pub fn commit(&self, token: &str) -> Result<usize, DirectoryError> {
        self.lock().directory.commit(token)
    }

    /// Run one resolution pass and capture the resulting state for saving.
    ///
    /// The lock is released before this returns, so persistence and
    /// broadcast never block intake.
    pub fn resolve_tick(&self) -> (TickReport, PersistedState) {
        let mut guard = self.lock();
        let EngineState { world, directory } = &mut *guard;
        let report = resolver::resolve_tick(world, directory);
        let state = PersistedState {
            world: world.snapshot(),
            directory: directory.snapshot(),
        };
        (report, state)
    }

    pub fn snapshot(&self) -> PersistedState {
        let guard = self.lock();
        PersistedState {
            world: guard.world.snapshot(),
            directory: guard.directory.snapshot(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.lock().world.tick()
    }

    pub fn cell_at(&self, x: i64, y: i64) -> Result<Cell, WorldError> {
        self.lock().world.cell_at(x, y).cloned()
    }

    pub fn player_count(&self) -> usize {
        self.lock().directory.len()
    }

    /// Read-only access to both halves under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&WorldState, &PlayerDirectory) -> R) -> R {
        let guard = self.lock();
        f(&guard.world, &guard.directory)
    }
}
