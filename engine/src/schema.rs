//! Store and index declarations.
//!
//! A schema names the record stores of a local database and the secondary
//! indexes each store maintains. The engine adds its own metadata store and an
//! implicit `changedSinceSync` index on every declared store.

use crate::{error::Result, Error, SchemaVersion, StoreName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Name of the store holding the client id and the per-store sync cursors.
pub const META_STORE: &str = "__tether_meta";

/// Index over the pending flag, present on every declared store.
pub const CHANGED_INDEX: &str = "changedSinceSync";

/// A secondary index over one field of a store's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    /// Index name
    pub name: String,
    /// Dotted path of the indexed field, e.g. `owner.name`
    pub key_path: String,
}

impl IndexDef {
    /// Create an index named after the field it covers.
    pub fn new(key_path: impl Into<String>) -> Self {
        let key_path = key_path.into();
        Self {
            name: key_path.clone(),
            key_path,
        }
    }

    /// Create an index with a name different from its key path.
    pub fn named(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
        }
    }

    /// Look up the indexed value in a stored record.
    pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.key_path
            .split('.')
            .try_fold(value, |current, segment| current.as_object()?.get(segment))
    }
}

/// Declaration of a record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDef {
    /// Store name
    pub name: StoreName,
    /// Secondary indexes
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl StoreDef {
    /// Declare a store without secondary indexes.
    pub fn new(name: impl Into<StoreName>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    /// Builder-style method to add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Get an index definition by name, including the implicit pending index.
    pub fn index(&self, name: &str) -> Option<IndexDef> {
        if name == CHANGED_INDEX {
            return Some(IndexDef::new(CHANGED_INDEX));
        }
        self.indexes.iter().find(|i| i.name == name).cloned()
    }

    /// All indexes maintained for this store.
    pub fn all_indexes(&self) -> Vec<IndexDef> {
        let mut indexes = self.indexes.clone();
        indexes.push(IndexDef::new(CHANGED_INDEX));
        indexes
    }
}

/// Schema of a local database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version, bumped when stores or indexes change
    pub version: SchemaVersion,
    /// Store declarations by name
    pub stores: BTreeMap<StoreName, StoreDef>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            stores: BTreeMap::new(),
        }
    }

    /// Add a store to the schema.
    pub fn add_store(&mut self, store: StoreDef) -> &mut Self {
        self.stores.insert(store.name.clone(), store);
        self
    }

    /// Builder-style method to add a store.
    pub fn with_store(mut self, store: StoreDef) -> Self {
        self.add_store(store);
        self
    }

    /// Get a store declaration by name.
    pub fn get_store(&self, name: &str) -> Option<&StoreDef> {
        self.stores.get(name)
    }

    /// Get a store declaration, failing if it was never declared.
    pub fn require_store(&self, name: &str) -> Result<&StoreDef> {
        self.get_store(name)
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))
    }

    /// Names of all declared stores, in sorted order.
    pub fn store_names(&self) -> Vec<StoreName> {
        self.stores.keys().cloned().collect()
    }

    /// Check the declarations for reserved or duplicate names.
    pub fn validate(&self) -> Result<()> {
        for (name, store) in &self.stores {
            if name.is_empty() || name == META_STORE {
                return Err(Error::InvalidSchema(format!(
                    "'{}' is not a valid store name",
                    name
                )));
            }
            if name != &store.name {
                return Err(Error::InvalidSchema(format!(
                    "store '{}' is registered as '{}'",
                    store.name, name
                )));
            }
            let mut seen = std::collections::BTreeSet::new();
            for index in &store.indexes {
                if index.name == CHANGED_INDEX || !seen.insert(index.name.as_str()) {
                    return Err(Error::InvalidSchema(format!(
                        "duplicate index '{}' on store '{}'",
                        index.name, name
                    )));
                }
                if index.key_path.is_empty() {
                    return Err(Error::InvalidSchema(format!(
                        "index '{}' on store '{}' has an empty key path",
                        index.name, name
                    )));
                }
            }
        }
        Ok(())
    }
}
