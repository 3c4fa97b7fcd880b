//! In-memory change log.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tether_engine::{Change, Key, StoreName, Timestamp};

use super::{stamp, ChangeLog, Cursor, KeyState};
use crate::error::Result;

#[derive(Debug, Default)]
struct StoreLog {
    cursor: Cursor,
    changes: Vec<Change>,
    keys: HashMap<Key, KeyState>,
}

/// Change log kept in process memory.
///
/// Each store's log sits behind its own map shard lock, which serializes
/// writers per store and gives readers a consistent view.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    stores: DashMap<StoreName, StoreLog>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn save_change(&self, change: Change) -> Result<Change> {
        let mut log = self.stores.entry(change.store_name().clone()).or_default();
        let current = log.keys.get(change.key()).copied();
        let saved = stamp(change, current, &mut log.cursor)?;
        log.keys.insert(saved.key().clone(), KeyState::of(&saved));
        log.changes.push(saved.clone());
        Ok(saved)
    }

    async fn get_changes(&self, store: &str, since: Option<Timestamp>) -> Result<Vec<Change>> {
        let log = match self.stores.get(store) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };
        let start = since.map_or(0, |since| {
            log.changes
                .partition_point(|c| c.timestamp().is_some_and(|t| t <= since))
        });
        Ok(log.changes[start..].to_vec())
    }

    async fn reset_changes(&self) -> Result<()> {
        self.stores.clear();
        Ok(())
    }
}
