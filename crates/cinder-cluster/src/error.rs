//! Cluster-layer errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("malformed cluster message: {0}")]
    Malformed(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("peer unreachable after retries: {0}")]
    Unreachable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
