//! The server change log and its backends.
//!
//! Every backend implements [`ChangeLog`] with the same semantics: changes get
//! a per-store timestamp starting at 0 with no gaps, creates get a server key
//! and version 0, and updates and deletes must name the key's current version.

mod couchdb;
mod memory;
mod postgres;

pub use couchdb::CouchDbChangeLog;
pub use memory::MemoryChangeLog;
pub use postgres::PostgresChangeLog;

use std::sync::Arc;

use async_trait::async_trait;
use tether_engine::{Change, Key, Timestamp, Version};

use crate::config::Persistence;
use crate::error::{AppError, Result};

/// Durable, per-store, timestamp-ordered log of accepted changes.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Stamp a change with its version and timestamp and persist it.
    ///
    /// Returns the stamped change; a create also carries its server key.
    async fn save_change(&self, change: Change) -> Result<Change>;

    /// All changes of `store` with a timestamp greater than `since`, in
    /// ascending timestamp order. `None` returns the whole log.
    async fn get_changes(&self, store: &str, since: Option<Timestamp>) -> Result<Vec<Change>>;

    /// Drop every change of every store.
    async fn reset_changes(&self) -> Result<()>;
}

/// Open the backend selected by the configuration.
pub async fn open(persistence: &Persistence) -> Result<Arc<dyn ChangeLog>> {
    Ok(match persistence {
        Persistence::Memory => Arc::new(MemoryChangeLog::new()),
        Persistence::Postgres { database_url } => {
            Arc::new(PostgresChangeLog::connect(database_url).await?)
        }
        Persistence::CouchDb { url } => Arc::new(CouchDbChangeLog::connect(url).await?),
    })
}

/// The server's view of one key: its latest version and whether it is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyState {
    pub version: Version,
    pub deleted: bool,
}

impl KeyState {
    pub fn of(change: &Change) -> Self {
        Self {
            version: change.version(),
            deleted: matches!(change, Change::Delete(_)),
        }
    }
}

/// Sequence state of one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub next_timestamp: Timestamp,
    pub next_key: i64,
}

/// Validate a change against the current state of its key and stamp it.
///
/// Advances `cursor` only when the change is accepted.
pub(crate) fn stamp(mut change: Change, current: Option<KeyState>, cursor: &mut Cursor) -> Result<Change> {
    let timestamp = cursor.next_timestamp;
    match &change {
        Change::Create(_) => {
            let key = Key::Int(cursor.next_key);
            change.stamp(key, 0, timestamp);
            cursor.next_key += 1;
        }
        Change::Update(_) | Change::Delete(_) => {
            let state = current.filter(|s| !s.deleted).ok_or_else(|| AppError::UnknownKey {
                store: change.store_name().clone(),
                key: change.key().clone(),
            })?;
            if state.version != change.version() {
                return Err(AppError::VersionConflict {
                    store: change.store_name().clone(),
                    key: change.key().clone(),
                    expected: state.version,
                    found: change.version(),
                });
            }
            let key = change.key().clone();
            change.stamp(key, state.version + 1, timestamp);
        }
    }
    cursor.next_timestamp += 1;
    Ok(change)
}
