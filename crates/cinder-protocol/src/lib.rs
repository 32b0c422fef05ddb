//! cinder-protocol: the wire layer.
//!
//! Commands arrive as LF-terminated text lines and are split by
//! [`tokenize`], which honors single- and double-quoted arguments.
//! [`Command`] turns a token list into a typed command with arity
//! checking. Replies leave as RESP frames serialized by [`Frame`].

pub mod command;
pub mod error;
mod serialize;
pub mod tokenize;
pub mod types;

pub use command::Command;
pub use error::ProtocolError;
pub use tokenize::{strip_quotes, tokenize};
pub use types::Frame;
