//! cinder-persistence: durable storage formats.
//!
//! Two independent strategies live here: point-in-time snapshots of the
//! full shard vector ([`snapshot`]) and a line-oriented append-log of
//! mutating commands ([`aof`]). Shared binary primitives are in
//! [`format`]. The snapshot entry codec is also the payload encoding for
//! full-state replication pulls.

pub mod aof;
pub mod format;
pub mod snapshot;

pub use aof::{AofLog, FsyncPolicy, ReplayCommand};
pub use format::FormatError;
pub use snapshot::{SnapEntry, SnapValue};
