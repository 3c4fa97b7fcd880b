//! Change types exchanged between replicas and the server.
//!
//! A change is the unit of the server change log. Clients send unstamped changes;
//! the server stamps them with a version and a store-scoped timestamp before
//! persisting and distributing them.

use crate::{diff, error::Result, Delta, Error, Fields, Key, Record, StoreName, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// A record created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChange {
    /// Target store
    pub store_name: StoreName,
    /// Key of the record; the server may assign a different one
    pub key: Key,
    /// Initial fields
    pub record: Fields,
    /// Assigned version (always 0 once stamped)
    #[serde(default)]
    pub version: Version,
    /// Position in the store's change log, set by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Replica that produced the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A record updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChange {
    /// Target store
    pub store_name: StoreName,
    /// Key of the record
    pub key: Key,
    /// Version the diff is based on when sent; the new version once stamped
    pub version: Version,
    /// Delta from the last agreed state
    pub diff: Delta,
    /// Position in the store's change log, set by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Replica that produced the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A record deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteChange {
    /// Target store
    pub store_name: StoreName,
    /// Key of the record
    pub key: Key,
    /// Version the delete is based on when sent; the new version once stamped
    pub version: Version,
    /// Position in the store's change log, set by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Replica that produced the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A change to one record of one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Change {
    Create(CreateChange),
    Update(UpdateChange),
    Delete(DeleteChange),
}

impl Change {
    /// Get the store this change targets.
    pub fn store_name(&self) -> &StoreName {
        match self {
            Change::Create(c) => &c.store_name,
            Change::Update(c) => &c.store_name,
            Change::Delete(c) => &c.store_name,
        }
    }

    /// Get the key of the record this change targets.
    pub fn key(&self) -> &Key {
        match self {
            Change::Create(c) => &c.key,
            Change::Update(c) => &c.key,
            Change::Delete(c) => &c.key,
        }
    }

    /// Get the version carried by the change.
    pub fn version(&self) -> Version {
        match self {
            Change::Create(c) => c.version,
            Change::Update(c) => c.version,
            Change::Delete(c) => c.version,
        }
    }

    /// Get the server timestamp, if stamped.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Change::Create(c) => c.timestamp,
            Change::Update(c) => c.timestamp,
            Change::Delete(c) => c.timestamp,
        }
    }

    /// Get the originating client, if known.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Change::Create(c) => c.client_id.as_deref(),
            Change::Update(c) => c.client_id.as_deref(),
            Change::Delete(c) => c.client_id.as_deref(),
        }
    }

    /// The wire name of the change type.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Create(_) => "create",
            Change::Update(_) => "update",
            Change::Delete(_) => "delete",
        }
    }

    /// Stamp the change with its log position and resulting version.
    pub fn stamp(&mut self, key: Key, version: Version, timestamp: Timestamp) {
        match self {
            Change::Create(c) => {
                c.key = key;
                c.version = version;
                c.timestamp = Some(timestamp);
            }
            Change::Update(c) => {
                c.key = key;
                c.version = version;
                c.timestamp = Some(timestamp);
            }
            Change::Delete(c) => {
                c.key = key;
                c.version = version;
                c.timestamp = Some(timestamp);
            }
        }
    }

    /// Build the outbound change for a record pending sync.
    ///
    /// Tombstones become deletes, records with a last agreed state become updates
    /// carrying a delta from that state, and everything else is a create.
    pub fn from_record(
        store_name: &str,
        record: &Record,
        client_id: Option<&str>,
    ) -> Result<Self> {
        let client_id = client_id.map(str::to_string);
        if record.deleted {
            let version = record.version.ok_or_else(|| {
                Error::InvalidRecord(format!("tombstone {} has no server version", record.key))
            })?;
            return Ok(Change::Delete(DeleteChange {
                store_name: store_name.to_string(),
                key: record.key.clone(),
                version,
                timestamp: None,
                client_id,
            }));
        }
        match (&record.remote_original, record.version) {
            (Some(original), Some(version)) => Ok(Change::Update(UpdateChange {
                store_name: store_name.to_string(),
                key: record.key.clone(),
                version,
                diff: diff(original, &record.fields),
                timestamp: None,
                client_id,
            })),
            (Some(_), None) => Err(Error::InvalidRecord(format!(
                "record {} has a remote original but no server version",
                record.key
            ))),
            (None, _) => Ok(Change::Create(CreateChange {
                store_name: store_name.to_string(),
                key: record.key.clone(),
                record: record.fields.clone(),
                version: 0,
                timestamp: None,
                client_id,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn create_from_new_record() {
        let record = Record::new(Key::from("tmp"), fields(json!({"length": 100})));
        let change = Change::from_record("roads", &record, Some("c1")).unwrap();
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            json!({
                "type": "create",
                "storeName": "roads",
                "key": "tmp",
                "record": {"length": 100},
                "version": 0,
                "clientId": "c1"
            })
        );
    }

    #[test]
    fn update_carries_delta_from_remote_original() {
        let mut record = Record::synced(Key::Int(0), 2, fields(json!({"length": 110})));
        record.changed_since_sync = true;
        record.remote_original = Some(fields(json!({"length": 100})));

        let change = Change::from_record("roads", &record, None).unwrap();
        match &change {
            Change::Update(u) => {
                assert_eq!(u.version, 2);
                assert_eq!(serde_json::to_value(&u.diff).unwrap(), json!({"m": {"0": 110}}));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn delete_from_tombstone() {
        let record = Record::synced(Key::Int(5), 1, fields(json!({"a": 1}))).tombstone();
        let change = Change::from_record("roads", &record, None).unwrap();
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            json!({"type": "delete", "storeName": "roads", "key": 5, "version": 1})
        );
    }

    #[test]
    fn tombstone_without_version_is_invalid() {
        let record = Record::new(Key::Int(5), Fields::new()).tombstone();
        assert!(matches!(
            Change::from_record("roads", &record, None),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn stamp_sets_log_position() {
        let record = Record::new(Key::from("tmp"), fields(json!({"length": 100})));
        let mut change = Change::from_record("roads", &record, None).unwrap();
        change.stamp(Key::Int(0), 0, 7);
        assert_eq!(change.key(), &Key::Int(0));
        assert_eq!(change.timestamp(), Some(7));
        assert_eq!(change.kind(), "create");
    }

    #[test]
    fn parse_stamped_update() {
        let change: Change = serde_json::from_value(json!({
            "type": "update",
            "storeName": "roads",
            "key": 0,
            "version": 1,
            "diff": {"m": {"0": 130}},
            "timestamp": 3
        }))
        .unwrap();
        assert_eq!(change.store_name(), "roads");
        assert_eq!(change.version(), 1);
        assert_eq!(change.timestamp(), Some(3));
        assert_eq!(change.client_id(), None);
    }
}
