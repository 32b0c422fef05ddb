//! RESP reply frames.
//!
//! Only the server→client direction uses RESP framing; requests are
//! plain text lines. `Null` serializes as the RESP2 null bulk string
//! `$-1\r\n`.

use bytes::Bytes;

/// A single RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string, e.g. `+OK\r\n`.
    Simple(String),
    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),
    /// Integer, e.g. `:42\r\n`.
    Integer(i64),
    /// Binary-safe bulk string, e.g. `$3\r\nfoo\r\n`.
    Bulk(Bytes),
    /// Absent value: `$-1\r\n`.
    Null,
    /// Array of frames, e.g. `*2\r\n…`.
    Array(Vec<Frame>),
}

impl Frame {
    /// Convenience constructor for a UTF-8 bulk string.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// Standard `+OK` reply.
    pub fn ok() -> Self {
        Frame::Simple("OK".into())
    }
}
