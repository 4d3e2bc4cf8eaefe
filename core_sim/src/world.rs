use std::fmt;

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{GenerationParams, RobotDefaults};
use crate::directory::Token;

/// Coordinate of a grid cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub x: u32,
    pub y: u32,
}

impl GridPos {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spawn {
    /// Tick at which the spawn is available again.
    pub cooldown_until: u64,
    pub cooldown_amount: u64,
    pub energy_required: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerNode {
    #[serde(rename = "energy_produced_per_tick")]
    pub energy_per_tick: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLink {
    pub built_by: Token,
    pub health: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    pub owner: Token,
    pub health: u32,
    pub energy: u32,
    #[serde(default)]
    pub queued_action: String,
}

/// The single typed occupant of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    Spawn(Spawn),
    PowerNode(PowerNode),
    PowerLink(PowerLink),
    Robot(Robot),
}

impl Entity {
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Spawn(_) => "spawn",
            Entity::PowerNode(_) => "power_node",
            Entity::PowerLink(_) => "power_link",
            Entity::Robot(_) => "robot",
        }
    }
}

/// One grid position; holds zero or one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    pub entity: Option<Entity>,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        self.entity.is_none()
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self.entity, Some(Entity::Spawn(_)))
    }

    pub fn robot(&self) -> Option<&Robot> {
        match &self.entity {
            Some(Entity::Robot(robot)) => Some(robot),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("cell ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
    #[error("no spawn cell is available")]
    NoSpawnAvailable,
}

/// Fixed-size cell arena, row-major by coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
}

impl Grid {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![Cell::default(); width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, x: i64, y: i64) -> Result<usize, WorldError> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return Err(WorldError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(y as usize * self.width as usize + x as usize)
    }

    fn position(&self, index: usize) -> GridPos {
        let width = self.width as usize;
        GridPos::new((index % width) as u32, (index / width) as u32)
    }

    pub fn cell_at(&self, x: i64, y: i64) -> Result<&Cell, WorldError> {
        let index = self.index(x, y)?;
        Ok(&self.cells[index])
    }

    pub fn cell_mut(&mut self, pos: GridPos) -> Result<&mut Cell, WorldError> {
        let index = self.index(i64::from(pos.x), i64::from(pos.y))?;
        Ok(&mut self.cells[index])
    }

    pub fn set(&mut self, pos: GridPos, entity: Option<Entity>) -> Result<(), WorldError> {
        self.cell_mut(pos)?.entity = entity;
        Ok(())
    }

    /// Occupied cells in row-major order.
    pub fn occupied(&self) -> impl Iterator<Item = (GridPos, &Entity)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(index, cell)| cell.entity.as_ref().map(|e| (self.position(index), e)))
    }

    pub fn spawn_positions(&self) -> Vec<GridPos> {
        self.occupied()
            .filter(|(_, entity)| matches!(entity, Entity::Spawn(_)))
            .map(|(pos, _)| pos)
            .collect()
    }

    pub fn robots_owned_by(&self, owner: &Token) -> Vec<GridPos> {
        self.occupied()
            .filter(|(_, entity)| matches!(entity, Entity::Robot(robot) if &robot.owner == owner))
            .map(|(pos, _)| pos)
            .collect()
    }
}

/// Grid plus tick counter, captured for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub width: u32,
    pub height: u32,
    /// Occupied cells only, in row-major order.
    pub cells: Vec<(GridPos, Entity)>,
}

/// Authoritative spatial state mutated by tick resolution.
#[derive(Debug, Clone)]
pub struct WorldState {
    grid: Grid,
    tick: u64,
    rng: ChaCha8Rng,
}

impl WorldState {
    pub fn empty(width: u32, height: u32, seed: Option<u64>) -> Self {
        Self {
            grid: Grid::new(width, height),
            tick: 0,
            rng: seeded_rng(seed),
        }
    }

    /// Populate a fresh grid. Each cell is rolled once: below
    /// `spawn_probability` it becomes a spawn, below the cumulative
    /// `spawn_probability + power_node_probability` a power node, else empty.
    pub fn generate(params: &GenerationParams, seed: Option<u64>) -> Self {
        let mut world = Self::empty(params.width, params.height, seed);
        let node_threshold = params.spawn_probability + params.power_node_probability;
        let mut spawns = 0usize;
        let mut nodes = 0usize;

        for x in 0..params.width {
            for y in 0..params.height {
                let roll: f64 = world.rng.gen();
                let entity = if roll < params.spawn_probability {
                    spawns += 1;
                    Some(Entity::Spawn(Spawn {
                        cooldown_until: 0,
                        cooldown_amount: params.spawn.cooldown_amount,
                        energy_required: params.spawn.energy_required,
                    }))
                } else if roll < node_threshold {
                    nodes += 1;
                    Some(Entity::PowerNode(PowerNode {
                        energy_per_tick: params.power_node_energy_per_tick,
                    }))
                } else {
                    None
                };
                if entity.is_some() {
                    world.grid.cells[y as usize * params.width as usize + x as usize].entity =
                        entity;
                }
            }
        }

        info!(
            target: "surge::world",
            width = params.width,
            height = params.height,
            spawns,
            power_nodes = nodes,
            "world.generated"
        );
        world
    }

    /// Rebuild a world from a persisted snapshot. Cells outside the grid are
    /// dropped with a log line rather than failing the load.
    pub fn from_snapshot(snapshot: WorldSnapshot, seed: Option<u64>) -> Self {
        let mut world = Self::empty(snapshot.width, snapshot.height, seed);
        world.tick = snapshot.tick;
        for (pos, entity) in snapshot.cells {
            if let Err(err) = world.grid.set(pos, Some(entity)) {
                tracing::warn!(target: "surge::world", %pos, %err, "world.load_skipped_cell");
            }
        }
        world
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            width: self.grid.width,
            height: self.grid.height,
            cells: self
                .grid
                .occupied()
                .map(|(pos, entity)| (pos, entity.clone()))
                .collect(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn advance_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub(crate) fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    /// Bounds-checked read of one cell.
    pub fn cell_at(&self, x: i64, y: i64) -> Result<&Cell, WorldError> {
        self.grid.cell_at(x, y)
    }

    /// Place a new robot on a spawn cell chosen uniformly at random.
    ///
    /// The robot replaces the spawn entity, so a spawn hosts at most one
    /// robot and a cell never holds two entities. Callers serialise
    /// placements through the engine lock; the spawn list is rescanned on
    /// every call.
    pub fn place_robot_at_random_spawn(
        &mut self,
        owner: &Token,
        defaults: &RobotDefaults,
    ) -> Result<GridPos, WorldError> {
        let spawns = self.grid.spawn_positions();
        let pos = *spawns
            .choose(&mut self.rng)
            .ok_or(WorldError::NoSpawnAvailable)?;

        self.grid.set(
            pos,
            Some(Entity::Robot(Robot {
                owner: owner.clone(),
                health: defaults.health,
                energy: defaults.energy,
                queued_action: String::new(),
            })),
        )?;
        debug!(target: "surge::world", owner = %owner.redacted(), %pos, "robot.placed");
        Ok(pos)
    }
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}
