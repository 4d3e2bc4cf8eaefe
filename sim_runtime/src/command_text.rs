use thiserror::Error;

use crate::commands::{Request, StagedCommand};

/// Malformed request line. The connection stays open after reporting one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid command format")]
    Empty,
    #[error("Unknown command {0}")]
    UnknownRequest(String),
    #[error("Invalid INIT_PLAYER format: INIT_PLAYER [APIKEY] NAME")]
    InitPlayerFormat,
    #[error("COMMAND requires API key and action")]
    CommandFormat,
    #[error("COMMIT requires API key")]
    CommitFormat,
}

/// Parse one line of the text protocol.
///
/// Request verbs are matched exactly (upper case). Everything after the
/// token of a `COMMAND` is kept verbatim as the staged command.
pub fn parse_request_line(input: &str) -> Result<Request, ProtocolError> {
    let mut parts = input.split_whitespace();
    let verb = parts.next().ok_or(ProtocolError::Empty)?;

    match verb {
        "HELP" => Ok(Request::Help),
        "NEW_API_KEY" => Ok(Request::NewApiKey),
        "INIT_PLAYER" => {
            let args: Vec<&str> = parts.collect();
            match args.as_slice() {
                [] => Err(ProtocolError::InitPlayerFormat),
                [name] => Ok(Request::InitPlayer {
                    token: None,
                    name: (*name).to_string(),
                }),
                [token, name @ ..] => Ok(Request::InitPlayer {
                    token: Some((*token).to_string()),
                    name: name.join(" "),
                }),
            }
        }
        "COMMAND" => {
            let token = parts.next().ok_or(ProtocolError::CommandFormat)?;
            let command =
                StagedCommand::from_parts(parts).map_err(|_| ProtocolError::CommandFormat)?;
            Ok(Request::Command {
                token: token.to_string(),
                command,
            })
        }
        "COMMIT" => {
            let token = parts.next().ok_or(ProtocolError::CommitFormat)?;
            Ok(Request::Commit {
                token: token.to_string(),
            })
        }
        other => Err(ProtocolError::UnknownRequest(other.to_string())),
    }
}
