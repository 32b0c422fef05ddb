//! Error types for keyspace operations.

use thiserror::Error;

/// The key holds a value of a different variant than the operation
/// expects. The message is the wire-level error text.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
pub struct WrongType;

/// Errors from the integer command family (INCR, DECR, HINCRBY).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegerError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,
}

impl From<WrongType> for IntegerError {
    fn from(_: WrongType) -> Self {
        IntegerError::WrongType
    }
}

/// Errors from LSET, which distinguishes a missing key from a bad index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListSetError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR index out of range")]
    IndexOutOfRange,
}

impl From<WrongType> for ListSetError {
    fn from(_: WrongType) -> Self {
        ListSetError::WrongType
    }
}
