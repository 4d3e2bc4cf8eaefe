use sim_runtime::{parse_request_line, Rejection, Request, Response};
use tracing::{debug, warn};

use crate::directory::{DirectoryError, Token};
use crate::engine::Engine;

impl From<DirectoryError> for Rejection {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::DuplicatePlayer(_) => Rejection::PlayerExists,
            DirectoryError::UnknownPlayer => Rejection::PlayerNotFound,
            DirectoryError::NoSpawnAvailable | DirectoryError::World(_) => {
                Rejection::RobotUnavailable
            }
        }
    }
}

/// Parse and execute one request line, producing the reply for the caller.
pub fn handle_line(engine: &Engine, line: &str) -> Response {
    match parse_request_line(line) {
        Ok(request) => handle_request(engine, request),
        Err(err) => {
            debug!(target: "surge::intake", %err, "request.malformed");
            Response::from(err)
        }
    }
}

pub fn handle_request(engine: &Engine, request: Request) -> Response {
    match request {
        Request::Help => Response::Help,
        Request::NewApiKey => Response::ApiKey(engine.issue_token().to_string()),
        Request::InitPlayer { token, name } => {
            let (token, issued) = match token {
                Some(token) => (Token::from(token), false),
                None => (engine.issue_token(), true),
            };
            let issued_key = issued.then(|| token.to_string());
            match engine.register(token, &name) {
                Ok(_) => Response::PlayerInitialized { name, issued_key },
                Err(err) => {
                    warn!(target: "surge::intake", %err, "player.register_failed");
                    Response::Error(err.into())
                }
            }
        }
        Request::Command { token, command } => match engine.stage(&token, command) {
            Ok(_) => Response::CommandStaged,
            Err(err) => Response::Error(err.into()),
        },
        Request::Commit { token } => match engine.commit(&token) {
            Ok(moved) => {
                debug!(target: "surge::intake", commands = moved, "commands.committed");
                Response::CommandsCommitted
            }
            Err(err) => Response::Error(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotDefaults;
    use crate::directory::PlayerDirectory;
    use crate::world::{Entity, GridPos, Spawn, WorldState};

    fn engine(spawns: u32) -> Engine {
        let mut world = WorldState::empty(spawns.max(1), 1, Some(1));
        for x in 0..spawns {
            world
                .grid_mut()
                .set(
                    GridPos::new(x, 0),
                    Some(Entity::Spawn(Spawn {
                        cooldown_until: 0,
                        cooldown_amount: 10,
                        energy_required: 50,
                    })),
                )
                .unwrap();
        }
        Engine::new(world, PlayerDirectory::new(), RobotDefaults::default())
    }

    fn reply(engine: &Engine, line: &str) -> String {
        handle_line(engine, line).to_string()
    }

    #[test]
    fn register_stage_commit_scenario() {
        let engine = engine(2);
        assert_eq!(
            reply(&engine, "INIT_PLAYER TKA alice"),
            "OK: Player initialized and robot created at a spawn point"
        );
        assert_eq!(reply(&engine, "COMMAND TKA MOVE 1 1"), "OK: Command staged");
        assert_eq!(reply(&engine, "COMMIT TKA"), "OK: Commands committed");
        assert_eq!(
            reply(&engine, "COMMAND DEADBEEF MOVE 1 1"),
            "ERROR: Player not found"
        );
        assert_eq!(
            reply(&engine, "INIT_PLAYER TKA alice"),
            "ERROR: Player already exists"
        );
    }

    #[test]
    fn single_argument_init_issues_a_key() {
        let engine = engine(1);
        let (name, key) = match handle_line(&engine, "INIT_PLAYER bob") {
            Response::PlayerInitialized {
                name,
                issued_key: Some(key),
            } => (name, key),
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(name, "bob");
        assert_eq!(reply(&engine, &format!("COMMIT {key}")), "OK: Commands committed");
    }

    #[test]
    fn exhausted_spawns_reject_registration() {
        let engine = engine(0);
        assert_eq!(
            reply(&engine, "INIT_PLAYER TKA alice"),
            "ERROR: Could not create robot for player"
        );
        assert_eq!(reply(&engine, "COMMIT TKA"), "ERROR: Player not found");
    }

    #[test]
    fn new_api_key_replies_with_token() {
        let engine = engine(0);
        let line = reply(&engine, "NEW_API_KEY");
        let key = line.strip_prefix("NEW_API_KEY ").unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn protocol_errors_are_reported() {
        let engine = engine(0);
        assert_eq!(
            reply(&engine, "COMMAND TKA"),
            "ERROR: COMMAND requires API key and action"
        );
        assert_eq!(reply(&engine, "COMMIT"), "ERROR: COMMIT requires API key");
        assert_eq!(reply(&engine, "JUMP"), "ERROR: Unknown command JUMP");
        assert!(reply(&engine, "HELP").starts_with("# COMMANDS:"));
    }
}
