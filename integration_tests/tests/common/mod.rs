#![allow(dead_code)]

use core_sim::{
    Engine, Entity, GridPos, PlayerDirectory, RobotDefaults, Spawn, WorldSnapshot, WorldState,
};
use sim_runtime::StagedCommand;

/// A `width x 1` world whose first `spawns` cells are spawn points.
pub fn world_with_spawns(width: u32, spawns: u32) -> WorldState {
    let cells = (0..spawns.min(width))
        .map(|x| {
            (
                GridPos::new(x, 0),
                Entity::Spawn(Spawn {
                    cooldown_until: 0,
                    cooldown_amount: 10,
                    energy_required: 50,
                }),
            )
        })
        .collect();
    WorldState::from_snapshot(
        WorldSnapshot {
            tick: 0,
            width,
            height: 1,
            cells,
        },
        Some(42),
    )
}

pub fn engine_with_spawns(spawns: u32) -> Engine {
    Engine::new(
        world_with_spawns(spawns.max(1), spawns),
        PlayerDirectory::new(),
        RobotDefaults::default(),
    )
}

pub fn command(verb: &str, params: &[&str]) -> StagedCommand {
    StagedCommand::new(verb, params.iter().map(|p| p.to_string()).collect())
}
