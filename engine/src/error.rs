//! Error types for the Tether engine.

use crate::{Key, StoreName};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("store not found: {0}")]
    StoreNotFound(StoreName),

    #[error("key not found in store '{store}': {key}")]
    KeyNotFound { store: StoreName, key: Key },

    #[error("index '{index}' not found in store '{store}'")]
    IndexNotFound { store: StoreName, index: String },

    // Validation errors
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Transaction errors
    #[error("store '{0}' is not part of this transaction")]
    StoreNotInTransaction(StoreName),

    #[error("write attempted in a read-only transaction")]
    ReadOnlyTransaction,

    // Sync hook errors
    #[error("conflict on key {key} in store '{store}' but no conflict handler is registered")]
    ConflictResolutionRequired { store: StoreName, key: Key },

    #[error("reject received for store '{0}' but no reject handler is registered")]
    RejectHandlerRequired(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    pub(crate) fn key_not_found(store: &str, key: &Key) -> Self {
        Error::KeyNotFound {
            store: store.to_string(),
            key: key.clone(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRecord(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::StoreNotFound("roads".into());
        assert_eq!(err.to_string(), "store not found: roads");

        let err = Error::KeyNotFound {
            store: "roads".into(),
            key: Key::Int(7),
        };
        assert_eq!(err.to_string(), "key not found in store 'roads': 7");

        let err = Error::ConflictResolutionRequired {
            store: "roads".into(),
            key: Key::from("a1"),
        };
        assert_eq!(
            err.to_string(),
            "conflict on key a1 in store 'roads' but no conflict handler is registered"
        );
    }
}
