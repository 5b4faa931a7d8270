use std::io;
use thiserror::Error;

/// Error type for kvs operations.
#[derive(Error, Debug)]
pub enum KvsError {
    /// IO error from file or pipe operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// System call error from FIFO creation or teardown.
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    /// Key refused by the store's bucket scheme.
    #[error("invalid key {0:?}: first character must be an ASCII letter")]
    InvalidKey(String),

    /// Malformed or oversized wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server denied a session request.
    #[error("server denied operation: {0}")]
    Denied(&'static str),

    /// Invalid configuration or CLI usage.
    #[error("{0}")]
    Config(String),
}

/// Result type alias for kvs operations.
pub type Result<T> = std::result::Result<T, KvsError>;
