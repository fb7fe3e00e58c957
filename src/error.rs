use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid kuid length")]
    InvalidKuid,

    #[error("request timed out")]
    Timeout,

    #[error("bootstrap failed: no seed responded")]
    BootstrapFailed,

    #[error("node id collision detected")]
    CollisionDetected,

    #[error("illegal socket address: {0}")]
    IllegalAddress(SocketAddr),

    #[error("store rejected by every node")]
    StoreRejected,

    #[error("value not found")]
    NotFound,

    #[error("too many pending requests")]
    PendingLimit,

    #[error("node is shutting down")]
    Shutdown,
}
