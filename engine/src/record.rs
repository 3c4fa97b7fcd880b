//! Record types for storing data.

use crate::{error::Result, Error, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Application fields of a record, without sync metadata.
pub type Fields = serde_json::Map<String, Value>;

/// Field names owned by the engine. Application values under these names are ignored.
pub const RESERVED_FIELDS: [&str; 5] = [
    "key",
    "version",
    "changedSinceSync",
    "deleted",
    "remoteOriginal",
];

/// Primary key of a record, unique per store.
///
/// Only integers and strings are valid keys. Integer keys sort before string keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Generate a fresh random key for a record created locally.
    pub fn generate() -> Self {
        Key::Str(uuid::Uuid::new_v4().to_string())
    }

    /// Extract a key from a JSON value, failing closed on anything that is not
    /// an integer or a string.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Key::Str(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(Key::Int)
                .ok_or_else(|| Error::InvalidKey(format!("{} is not a valid key", n))),
            other => Err(Error::InvalidKey(format!("{} is not a valid key", other))),
        }
    }

    /// The key as a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(n) => Value::from(*n),
            Key::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

/// Origin of a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written by the application
    Local,
    /// Applied from an incoming sync message
    Remote,
    /// Bookkeeping by the sync engine itself; never re-triggers sync or public events
    Internal,
}

/// A record stored in a local store.
///
/// Serializes flat: the application fields sit next to the sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Primary key
    pub key: Key,
    /// Server version; absent until the server first acknowledges the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Whether the record diverged from the last server-confirmed state
    #[serde(default, with = "flag")]
    pub changed_since_sync: bool,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Last state known to equal the server's copy, kept while the record is pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_original: Option<Fields>,
    /// Application fields
    #[serde(flatten)]
    pub fields: Fields,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Record {
    /// Create a record written locally that the server has never seen.
    pub fn new(key: Key, fields: Fields) -> Self {
        Self {
            key,
            version: None,
            changed_since_sync: true,
            deleted: false,
            remote_original: None,
            fields,
        }
    }

    /// Create a record that mirrors the server's copy.
    pub fn synced(key: Key, version: Version, fields: Fields) -> Self {
        Self {
            key,
            version: Some(version),
            changed_since_sync: false,
            deleted: false,
            remote_original: None,
            fields,
        }
    }

    /// Split an application value into its optional key and its fields.
    ///
    /// Reserved metadata names are dropped from the fields.
    pub fn parse_input(value: Value) -> Result<(Option<Key>, Fields)> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidRecord(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };
        let key = match fields.remove("key") {
            None | Some(Value::Null) => None,
            Some(k) => Some(Key::from_value(&k)?),
        };
        for name in RESERVED_FIELDS {
            fields.remove(name);
        }
        Ok((key, fields))
    }

    /// Deserialize a record from its stored representation.
    pub fn from_stored(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize a record to its stored representation.
    pub fn to_stored(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// The record as the application sees it: its fields plus `key`.
    pub fn view(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("key".into(), self.key.to_value());
        Value::Object(fields)
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Whether the server has acknowledged this record at least once.
    pub fn is_known_remotely(&self) -> bool {
        self.remote_original.is_some() || (self.version.is_some() && !self.changed_since_sync)
    }

    /// Build the tombstone replacing this record on a local delete.
    pub fn tombstone(&self) -> Record {
        Record {
            key: self.key.clone(),
            version: self.version,
            changed_since_sync: true,
            deleted: true,
            remote_original: Some(
                self.remote_original
                    .clone()
                    .unwrap_or_else(|| self.fields.clone()),
            ),
            fields: Fields::new(),
        }
    }

    /// Mark the record as equal to the server's copy at the given version.
    pub fn mark_synced(&mut self, version: Version) {
        self.version = Some(version);
        self.changed_since_sync = false;
        self.remote_original = None;
    }
}

/// Serializes a boolean as the integers `0` and `1`, which keeps it indexable.
mod flag {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
            Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
            other => Err(de::Error::custom(format!(
                "expected 0 or 1 for changedSinceSync, got {}",
                other
            ))),
        }
    }
}
