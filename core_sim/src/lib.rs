//! Core crate for the Surge headless world server.
//!
//! Clients stage robot commands over a line-oriented TCP protocol, commit
//! them in batches, and a fixed-interval scheduler resolves every committed
//! batch, persists the result, and announces the new tick to all
//! connections. Start with [`build_engine`] and [`TickScheduler`].

pub mod config;
pub mod directory;
pub mod engine;
pub mod network;
pub mod persistence;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod world;

use tracing::info;

pub use config::{
    BackoffConfig, ConfigError, GenerationParams, RobotDefaults, ServerConfig, SpawnDefaults,
};
pub use directory::{
    DirectoryError, DirectorySnapshot, Player, PlayerDirectory, PlayerId, PlayerRecord, Token,
};
pub use engine::{Engine, PersistedState};
pub use network::{serve, ConnectionId, ConnectionRegistry, TickBroadcast};
pub use persistence::{
    FileStore, KeyValueStore, MemoryStore, PersistenceError, PersistenceGateway, WriteBatch,
};
pub use resolver::{
    resolve_tick, CommandOutcome, CommandResolutionError, ExecutedCommand, TickReport,
};
pub use scheduler::{
    CycleReport, PersistenceHealth, RunSummary, SaveOutcome, TickPhase, TickScheduler,
};
pub use world::{
    Cell, Entity, Grid, GridPos, PowerLink, PowerNode, Robot, Spawn, WorldError, WorldSnapshot,
    WorldState,
};

/// Restore the engine from `gateway`, or generate and persist a fresh world.
///
/// A stored grid is reused as-is; the player directory is loaded alongside
/// it when present. A freshly generated grid is saved before this returns.
/// A stored grid whose size differs from the configured one is an error;
/// the world is never resized.
pub fn build_engine(
    config: &ServerConfig,
    gateway: &mut PersistenceGateway,
) -> Result<Engine, PersistenceError> {
    if let Some((stored_width, stored_height)) = gateway.grid_dimensions()? {
        if (stored_width, stored_height) != (config.grid_width, config.grid_height) {
            return Err(PersistenceError::GridMismatch {
                stored_width,
                stored_height,
                width: config.grid_width,
                height: config.grid_height,
            });
        }
    }
    let stored = gateway.load_world_snapshot()?;
    let fresh = stored.is_none();
    let world = match stored {
        Some(snapshot) => {
            info!(
                target: "surge::persistence",
                tick = snapshot.tick,
                cells = snapshot.cells.len(),
                "world.loaded"
            );
            WorldState::from_snapshot(snapshot, config.world_seed)
        }
        None => WorldState::generate(&config.generation(), config.world_seed),
    };

    let directory = match gateway.load_player_directory()? {
        Some(snapshot) => {
            info!(
                target: "surge::persistence",
                players = snapshot.players.len(),
                "directory.loaded"
            );
            PlayerDirectory::from_snapshot(snapshot)
        }
        None => PlayerDirectory::new(),
    };

    let engine = Engine::new(world, directory, config.robot.clone());
    if fresh {
        gateway.save(&engine.snapshot())?;
    }
    Ok(engine)
}
