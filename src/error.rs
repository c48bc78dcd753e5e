//! Error types shared by the monitor, the transports and the configuration loader.

use thiserror::Error;

/// Errors surfaced by the distributed monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A send targeted a peer that is not in the peer table.
    #[error("peer `{0}` not found")]
    PeerNotFound(String),

    /// An inbound message could not be understood. Only ever logged by the
    /// inbound path, never handed to application tasks.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The condition variable was never registered on this monitor.
    #[error("unknown condition variable `{0}`")]
    UnknownCondition(String),

    /// The condition variable belongs to a different monitor instance.
    #[error("condition variable `{0}` belongs to another monitor")]
    ForeignCondition(String),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer table is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket or file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
