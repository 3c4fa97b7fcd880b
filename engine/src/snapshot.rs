//! Snapshot types for persisting and restoring a local store.
//!
//! Snapshots are the bridge between the in-memory store and persistent storage.
//! They are designed for deterministic serialization to ensure consistency.

use crate::{error::Result, schema::META_STORE, Error, Key, Schema, SchemaVersion, StoreName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One stored value and its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: Key,
    pub value: Value,
}

impl SnapshotEntry {
    pub fn new(key: Key, value: Value) -> Self {
        Self { key, value }
    }
}

/// A point-in-time snapshot of every store, metadata store included.
///
/// Stores are kept in a BTreeMap and entries in key order, so equal contents
/// always serialize to identical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Entries by store name, sorted by key
    pub stores: BTreeMap<StoreName, Vec<SnapshotEntry>>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            stores: BTreeMap::new(),
        }
    }

    /// Add an entry, replacing any entry with the same key.
    pub fn add_entry(&mut self, store: &str, entry: SnapshotEntry) {
        let entries = self.stores.entry(store.to_string()).or_default();
        match entries.binary_search_by(|e| e.key.cmp(&entry.key)) {
            Ok(pos) => entries[pos] = entry,
            Err(pos) => entries.insert(pos, entry),
        }
    }

    /// Get an entry by store and key.
    pub fn get(&self, store: &str, key: &Key) -> Option<&Value> {
        let entries = self.stores.get(store)?;
        entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|pos| &entries[pos].value)
    }

    /// Count entries across all record stores.
    pub fn record_count(&self) -> usize {
        self.record_stores().map(|(_, e)| e.len()).sum()
    }

    /// Count records still waiting to be pushed.
    pub fn pending_count(&self) -> usize {
        self.record_stores()
            .flat_map(|(_, e)| e.iter())
            .filter(|e| e.value.get("changedSinceSync") == Some(&Value::from(1)))
            .count()
    }

    fn record_stores(&self) -> impl Iterator<Item = (&StoreName, &Vec<SnapshotEntry>)> {
        self.stores.iter().filter(|(name, _)| name.as_str() != META_STORE)
    }

    /// Validate the snapshot against a schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::InvalidSnapshot(format!(
                "schema version mismatch: expected {}, got {}",
                schema.version, self.schema_version
            )));
        }

        for name in self.stores.keys() {
            if name != META_STORE && schema.get_store(name).is_none() {
                return Err(Error::StoreNotFound(name.clone()));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version
    pub schema_version: SchemaVersion,
    /// Total record count, tombstones included
    pub record_count: usize,
    /// Records waiting to be pushed
    pub pending_count: usize,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            record_count: snapshot.record_count(),
            pending_count: snapshot.pending_count(),
        }
    }
}
