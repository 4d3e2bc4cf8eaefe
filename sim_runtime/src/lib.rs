//! Text protocol shared by the world server and its clients.
//!
//! Parses request lines, models staged commands and the closed action set,
//! and renders every response the server writes back on a connection. Kept
//! free of engine state so clients can depend on it without pulling in the
//! simulation.

mod command_text;
mod commands;

pub use command_text::{parse_request_line, ProtocolError};
pub use commands::{
    Action, ActionError, EmptyCommand, Rejection, Request, Response, StagedCommand, HELP_TEXT,
};
