use std::time::{Duration, Instant};

use sim_runtime::{Action, ActionError, StagedCommand};
use thiserror::Error;
use tracing::{debug, warn};

use crate::directory::{PlayerDirectory, PlayerId, Token};
use crate::world::{Entity, WorldState};

/// A staged command that could not be applied. Logged; never aborts a tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandResolutionError {
    #[error("unknown action verb '{0}'")]
    UnknownVerb(String),
    #[error(transparent)]
    InvalidParameters(#[from] ActionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The action was accepted and recorded on each robot the player owns.
    Applied { robots: usize },
    Rejected(CommandResolutionError),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub player: PlayerId,
    pub token: Token,
    pub command: StagedCommand,
    pub outcome: CommandOutcome,
}

/// Result of one resolution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Every drained command in execution order.
    pub executed: Vec<ExecutedCommand>,
    pub players: usize,
    pub elapsed: Duration,
}

impl TickReport {
    pub fn rejected(&self) -> usize {
        self.executed
            .iter()
            .filter(|entry| !entry.outcome.is_applied())
            .count()
    }

    /// Commands executed for one player, in order.
    pub fn commands_for(&self, token: &str) -> Vec<&StagedCommand> {
        self.executed
            .iter()
            .filter(|entry| entry.token.as_str() == token)
            .map(|entry| &entry.command)
            .collect()
    }
}

/// Drain every committed batch and apply it, then advance the tick by one.
///
/// Players are visited in registration order and each batch runs FIFO, so
/// two robots racing for the same cell always resolve the same way. The
/// caller holds the engine lock for the whole pass.
pub fn resolve_tick(world: &mut WorldState, directory: &mut PlayerDirectory) -> TickReport {
    let started = Instant::now();
    let mut executed = Vec::new();

    for token in directory.tokens_in_order() {
        let Some(player) = directory.get(token.as_str()).map(|p| p.id) else {
            continue;
        };
        let batch = match directory.drain_and_clear(token.as_str()) {
            Ok(batch) => batch,
            Err(_) => continue,
        };
        for command in batch {
            let outcome = apply_command(world, &token, &command);
            if let CommandOutcome::Rejected(err) = &outcome {
                warn!(
                    target: "surge::tick",
                    player = %player,
                    command = %command,
                    %err,
                    "command.rejected"
                );
            } else {
                debug!(target: "surge::tick", player = %player, command = %command, "command.applied");
            }
            executed.push(ExecutedCommand {
                player,
                token: token.clone(),
                command,
                outcome,
            });
        }
    }

    let tick = world.advance_tick();
    TickReport {
        tick,
        executed,
        players: directory.len(),
        elapsed: started.elapsed(),
    }
}

/// Apply a single command. Validation happens before any cell is touched, so
/// a rejected command leaves no trace in the world.
fn apply_command(
    world: &mut WorldState,
    owner: &Token,
    command: &StagedCommand,
) -> CommandOutcome {
    let action = match command.action() {
        Ok(Action::Unknown { verb }) => {
            return CommandOutcome::Rejected(CommandResolutionError::UnknownVerb(verb))
        }
        Ok(action) => action,
        Err(err) => return CommandOutcome::Rejected(err.into()),
    };

    let label = action_label(&action, command);
    let robots = world.grid().robots_owned_by(owner);
    for pos in &robots {
        if let Ok(cell) = world.grid_mut().cell_mut(*pos) {
            if let Some(Entity::Robot(robot)) = cell.entity.as_mut() {
                robot.queued_action = label.clone();
            }
        }
    }
    CommandOutcome::Applied {
        robots: robots.len(),
    }
}

fn action_label(action: &Action, command: &StagedCommand) -> String {
    match action {
        Action::Move { x, y } => format!("MOVE {} {}", x, y),
        _ => {
            let mut label = action.name().to_string();
            for param in &command.params {
                label.push(' ');
                label.push_str(param);
            }
            label
        }
    }
}
