use std::fmt;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command_text::ProtocolError;

/// Instruction staged by a player and held until the tick that resolves it.
///
/// Intake only checks that a verb is present. Parameters stay opaque strings
/// until resolution turns the command into an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StagedCommand {
    pub verb: String,
    pub params: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("staged command has no verb")]
pub struct EmptyCommand;

impl StagedCommand {
    pub fn new(verb: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            verb: verb.into(),
            params,
        }
    }

    /// Build a command from whitespace-separated parts; the first part is the verb.
    pub fn from_parts<I, S>(parts: I) -> Result<Self, EmptyCommand>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = parts.into_iter().map(Into::into);
        let verb = parts
            .next()
            .filter(|verb: &String| !verb.is_empty())
            .ok_or(EmptyCommand)?;
        Ok(Self {
            verb,
            params: parts.collect(),
        })
    }

    pub fn action(&self) -> Result<Action, ActionError> {
        Action::parse(self)
    }
}

impl fmt::Display for StagedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for param in &self.params {
            write!(f, " {}", param)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for StagedCommand {
    type Error = EmptyCommand;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_parts(value.split_whitespace())
    }
}

impl From<StagedCommand> for String {
    fn from(command: StagedCommand) -> Self {
        command.to_string()
    }
}

/// Closed set of robot actions a staged command can resolve to.
///
/// Only the shape of each action is defined here. `Move`, `Harvest` and
/// `Repair` carry no game mechanics yet; the engine acknowledges them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Move { x: i64, y: i64 },
    Harvest { params: Vec<String> },
    Repair { params: Vec<String> },
    Unknown { verb: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("{verb} is missing parameter {name}")]
    MissingParameter { verb: &'static str, name: &'static str },
    #[error("invalid integer '{value}' for {verb} {name}: {source}")]
    InvalidParameter {
        verb: &'static str,
        name: &'static str,
        value: String,
        source: ParseIntError,
    },
}

impl Action {
    /// Verbs match exactly, like request verbs: `move` is an unknown action.
    pub fn parse(command: &StagedCommand) -> Result<Self, ActionError> {
        match command.verb.as_str() {
            "MOVE" => {
                let x = parse_coordinate(command.params.first(), "x")?;
                let y = parse_coordinate(command.params.get(1), "y")?;
                Ok(Action::Move { x, y })
            }
            "HARVEST" => Ok(Action::Harvest {
                params: command.params.clone(),
            }),
            "REPAIR" => Ok(Action::Repair {
                params: command.params.clone(),
            }),
            _ => Ok(Action::Unknown {
                verb: command.verb.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Action::Move { .. } => "MOVE",
            Action::Harvest { .. } => "HARVEST",
            Action::Repair { .. } => "REPAIR",
            Action::Unknown { verb } => verb,
        }
    }
}

fn parse_coordinate(value: Option<&String>, name: &'static str) -> Result<i64, ActionError> {
    let value = value.ok_or(ActionError::MissingParameter { verb: "MOVE", name })?;
    value
        .parse::<i64>()
        .map_err(|source| ActionError::InvalidParameter {
            verb: "MOVE",
            name,
            value: value.clone(),
            source,
        })
}

/// Parsed request line from a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    NewApiKey,
    /// `token` is absent for the single-argument form, where the server issues one.
    InitPlayer {
        token: Option<String>,
        name: String,
    },
    Command {
        token: String,
        command: StagedCommand,
    },
    Commit {
        token: String,
    },
    Help,
}

pub const HELP_TEXT: &str = "\
# COMMANDS:

HELP
NEW_API_KEY
INIT_PLAYER [APIKEY] <PLAYERNAME>

# QUEUEING COMMANDS FOR THIS TICK

COMMAND <APIKEY> <COMMANDNAME> [PARAMETER1] [PARAMETER2] ...

# SENDING YOUR COMMANDS FOR EXECUTION

COMMIT <APIKEY>";

/// Player-facing rejection, always rendered as a single `ERROR:` line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Player not found")]
    PlayerNotFound,
    #[error("Player already exists")]
    PlayerExists,
    #[error("Could not create robot for player")]
    RobotUnavailable,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Everything the server writes back on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ApiKey(String),
    PlayerInitialized {
        name: String,
        issued_key: Option<String>,
    },
    CommandStaged,
    CommandsCommitted,
    Help,
    Tick(u64),
    Error(Rejection),
}

impl From<Rejection> for Response {
    fn from(rejection: Rejection) -> Self {
        Response::Error(rejection)
    }
}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Response::Error(Rejection::Protocol(err))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::ApiKey(key) => write!(f, "NEW_API_KEY {}", key),
            Response::PlayerInitialized { name, issued_key } => {
                f.write_str("OK: Player initialized and robot created at a spawn point")?;
                if let Some(key) = issued_key {
                    write!(f, "\nAPI_KEY FOR {}: {}", name, key)?;
                }
                Ok(())
            }
            Response::CommandStaged => f.write_str("OK: Command staged"),
            Response::CommandsCommitted => f.write_str("OK: Commands committed"),
            Response::Help => f.write_str(HELP_TEXT),
            Response::Tick(tick) => write!(f, "TICK {}", tick),
            Response::Error(rejection) => write!(f, "ERROR: {}", rejection),
        }
    }
}
