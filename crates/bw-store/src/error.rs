//! Store errors.

use thiserror::Error;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot clear the default limit")]
    DefaultLimitProtected,

    #[error("default limit row missing")]
    MissingDefault,

    #[error("invalid peer key in store: {0}")]
    InvalidPeer(String),

    #[error("unknown mode in store: {0}")]
    UnknownMode(String),

    #[error("store task failed: {0}")]
    Task(String),
}
