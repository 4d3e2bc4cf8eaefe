use std::borrow::Borrow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sim_runtime::StagedCommand;
use thiserror::Error;

use crate::config::RobotDefaults;
use crate::world::{GridPos, WorldError, WorldState};

const TOKEN_BYTES: usize = 16;
/// Issued tokens remembered while they wait for a registration. The oldest
/// are forgotten first.
pub const MAX_PENDING_TOKENS: usize = 1024;

/// Opaque per-player credential.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix suitable for log lines.
    pub fn redacted(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for Token {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Registration-order identifier. Resolution walks players in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("player {0} is already registered")]
    DuplicatePlayer(Token),
    #[error("no player is registered under the given token")]
    UnknownPlayer,
    #[error("no spawn cell is free for a new robot")]
    NoSpawnAvailable,
    #[error(transparent)]
    World(WorldError),
}

impl From<WorldError> for DirectoryError {
    fn from(err: WorldError) -> Self {
        match err {
            WorldError::NoSpawnAvailable => DirectoryError::NoSpawnAvailable,
            other => DirectoryError::World(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: PlayerId,
    pub token: Token,
    pub name: String,
    /// Commands accepted by intake, waiting for a commit.
    staged: Vec<StagedCommand>,
    /// Commands closed by `COMMIT`, drained by the next tick.
    committed: Vec<StagedCommand>,
}

impl Player {
    pub fn staged(&self) -> &[StagedCommand] {
        &self.staged
    }

    pub fn committed(&self) -> &[StagedCommand] {
        &self.committed
    }
}

/// Persisted form of one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub token: Token,
    pub name: String,
    pub staged: Vec<StagedCommand>,
    pub committed: Vec<StagedCommand>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    /// Players in registration order.
    pub players: Vec<PlayerRecord>,
}

/// Token to player mapping plus each player's command queues.
#[derive(Debug, Default)]
pub struct PlayerDirectory {
    players: Vec<Player>,
    index: HashMap<Token, usize>,
    pending: HashSet<Token>,
    pending_order: VecDeque<Token>,
}

impl PlayerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        let mut records = snapshot.players;
        records.sort_by_key(|record| record.id);
        let mut directory = Self::new();
        for record in records {
            directory
                .index
                .insert(record.token.clone(), directory.players.len());
            directory.players.push(Player {
                id: record.id,
                token: record.token,
                name: record.name,
                staged: record.staged,
                committed: record.committed,
            });
        }
        directory
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            players: self
                .players
                .iter()
                .map(|player| PlayerRecord {
                    id: player.id,
                    token: player.token.clone(),
                    name: player.name.clone(),
                    staged: player.staged.clone(),
                    committed: player.committed.clone(),
                })
                .collect(),
        }
    }

    /// Draw a fresh random token that matches no registered player and no
    /// other token still awaiting registration.
    pub fn issue_token(&mut self) -> Token {
        let token = loop {
            let mut bytes = [0u8; TOKEN_BYTES];
            OsRng.fill_bytes(&mut bytes);
            let token = Token(hex::encode(bytes));
            if !self.index.contains_key(&token) && self.pending.insert(token.clone()) {
                break token;
            }
        };
        self.pending_order.push_back(token.clone());
        while self.pending_order.len() > MAX_PENDING_TOKENS {
            if let Some(oldest) = self.pending_order.pop_front() {
                self.pending.remove(&oldest);
            }
        }
        token
    }

    /// Issued tokens not yet used to register.
    pub fn pending_tokens(&self) -> usize {
        self.pending.len()
    }

    /// Register a player and give it a robot on a random spawn cell.
    ///
    /// Either both the player and its robot exist afterwards, or neither does.
    pub fn register(
        &mut self,
        token: Token,
        name: &str,
        world: &mut WorldState,
        robot: &RobotDefaults,
    ) -> Result<(PlayerId, GridPos), DirectoryError> {
        if self.index.contains_key(&token) {
            return Err(DirectoryError::DuplicatePlayer(token));
        }
        let pos = world.place_robot_at_random_spawn(&token, robot)?;

        let id = PlayerId(
            self.players
                .last()
                .map(|player| player.id.0 + 1)
                .unwrap_or(0),
        );
        if self.pending.remove(&token) {
            self.pending_order.retain(|pending| pending != &token);
        }
        self.index.insert(token.clone(), self.players.len());
        self.players.push(Player {
            id,
            token,
            name: name.to_string(),
            staged: Vec::new(),
            committed: Vec::new(),
        });
        Ok((id, pos))
    }

    pub fn get(&self, token: &str) -> Option<&Player> {
        self.index.get(token).map(|&slot| &self.players[slot])
    }

    fn get_mut(&mut self, token: &str) -> Result<&mut Player, DirectoryError> {
        let slot = *self.index.get(token).ok_or(DirectoryError::UnknownPlayer)?;
        Ok(&mut self.players[slot])
    }

    pub fn contains(&self, token: &str) -> bool {
        self.index.contains_key(token)
    }

    /// Append one command to the player's staged queue.
    pub fn stage(&mut self, token: &str, command: StagedCommand) -> Result<usize, DirectoryError> {
        let player = self.get_mut(token)?;
        player.staged.push(command);
        Ok(player.staged.len())
    }

    /// Close the staged queue and append it to the batch the next tick executes.
    pub fn commit(&mut self, token: &str) -> Result<usize, DirectoryError> {
        let player = self.get_mut(token)?;
        let mut staged = std::mem::take(&mut player.staged);
        let moved = staged.len();
        player.committed.append(&mut staged);
        Ok(moved)
    }

    /// Return the committed batch in insertion order and leave it empty.
    pub fn drain_and_clear(&mut self, token: &str) -> Result<Vec<StagedCommand>, DirectoryError> {
        let player = self.get_mut(token)?;
        Ok(std::mem::take(&mut player.committed))
    }

    /// Tokens in registration order, the fixed resolution order.
    pub fn tokens_in_order(&self) -> Vec<Token> {
        self.players.iter().map(|player| player.token.clone()).collect()
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.iter()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
