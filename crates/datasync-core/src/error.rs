//! Core error types.

use thiserror::Error;

/// Errors raised by the store, the watch registry and the consumer.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Value encoding or decoding error.
    #[error("codec error: {0}")]
    Codec(#[from] datasync_proto::Error),

    /// A watch could not be established.
    #[error("watch error: {0}")]
    Watch(String),

    /// A stored key is not valid UTF-8.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}
