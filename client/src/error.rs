//! Error types for the Tether client.

use tether_engine::StoreName;
use thiserror::Error;

/// Errors surfaced by sync sessions and the database API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] tether_engine::Error),

    #[error("a sync session is already running on this database")]
    AlreadySyncing,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected to the server")]
    Disconnected,

    #[error("handling a server message panicked: {0}")]
    Panicked(String),

    #[error("server refused to sync store '{store}': {description}")]
    PullRejected {
        store: StoreName,
        description: String,
    },
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
