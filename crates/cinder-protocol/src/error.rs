//! Protocol-level errors, surfaced to the client as `-ERR …` replies.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR value is not a valid float")]
    NotAFloat,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR unbalanced quotes in request")]
    UnbalancedQuotes,

    #[error("ERR no command specified")]
    Empty,
}
