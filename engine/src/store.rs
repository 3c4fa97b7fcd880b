//! Local store contract and its in-memory implementation.
//!
//! A local store is a transactional key-value store over named stores, each
//! with secondary indexes. Values are opaque JSON documents; the record format
//! on top of them belongs to the change tracker.

use crate::{
    error::Result,
    schema::{IndexDef, Schema, StoreDef, META_STORE},
    snapshot::{SnapshotEntry, StoreSnapshot},
    Error, Key, StoreName,
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// A transaction over a fixed set of stores.
///
/// Writes become visible to other transactions on `commit`. Dropping a
/// transaction without committing discards its writes.
pub trait Transaction {
    /// Get the value stored under `key`.
    fn get(&self, store: &str, key: &Key) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&mut self, store: &str, key: Key, value: Value) -> Result<()>;

    /// Remove the value stored under `key`. Missing keys are ignored.
    fn delete(&mut self, store: &str, key: &Key) -> Result<()>;

    /// Query values by primary key (`index = None`) or by a secondary index,
    /// in index order.
    fn query(&self, store: &str, index: Option<&str>, query: &IndexQuery) -> Result<Vec<Value>>;

    /// Make all writes durable and visible.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// A transactional store holding the stores declared by a schema.
pub trait LocalStore: Send + Sync {
    /// The declarations this store was opened with.
    fn schema(&self) -> &Schema;

    /// Open a transaction scoped to `stores`.
    fn transaction(&self, stores: &[&str], mode: TxMode) -> Result<Box<dyn Transaction + '_>>;
}

/// A value as seen by an index. Numbers sort before strings.
#[derive(Debug, Clone)]
pub enum IndexValue {
    Number(f64),
    String(String),
}

impl IndexValue {
    /// Convert a JSON value. Only numbers and strings are indexable.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(IndexValue::Number),
            Value::String(s) => Some(IndexValue::String(s.clone())),
            _ => None,
        }
    }

    /// The index value of a primary key.
    pub fn from_key(key: &Key) -> Self {
        match key {
            Key::Int(n) => IndexValue::Number(*n as f64),
            Key::Str(s) => IndexValue::String(s.clone()),
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Number(a), IndexValue::Number(b)) => a.total_cmp(b),
            (IndexValue::Number(_), IndexValue::String(_)) => Ordering::Less,
            (IndexValue::String(_), IndexValue::Number(_)) => Ordering::Greater,
            (IndexValue::String(a), IndexValue::String(b)) => a.cmp(b),
        }
    }
}

impl From<i64> for IndexValue {
    fn from(n: i64) -> Self {
        IndexValue::Number(n as f64)
    }
}

impl From<f64> for IndexValue {
    fn from(n: f64) -> Self {
        IndexValue::Number(n)
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        IndexValue::String(s)
    }
}

/// Builder for index and primary-key queries.
///
/// ```
/// use tether_engine::IndexQuery;
///
/// // 100 < length <= 200, largest first, at most 10 results
/// let query = IndexQuery::all().gt(100).lte(200).reverse().limit(10);
/// # let _ = query;
/// ```
#[derive(Debug, Clone)]
pub struct IndexQuery {
    lower: Bound<IndexValue>,
    upper: Bound<IndexValue>,
    skip: usize,
    limit: Option<usize>,
    reverse: bool,
}

impl Default for IndexQuery {
    fn default() -> Self {
        Self::all()
    }
}

impl IndexQuery {
    /// Match every entry.
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            skip: 0,
            limit: None,
            reverse: false,
        }
    }

    /// Match entries equal to `value`.
    pub fn only(value: impl Into<IndexValue>) -> Self {
        let value = value.into();
        Self::range(Bound::Included(value.clone()), Bound::Included(value))
    }

    /// Match entries between two bounds.
    pub fn range(lower: Bound<IndexValue>, upper: Bound<IndexValue>) -> Self {
        Self {
            lower,
            upper,
            ..Self::all()
        }
    }

    pub fn gt(mut self, value: impl Into<IndexValue>) -> Self {
        self.lower = Bound::Excluded(value.into());
        self
    }

    pub fn gte(mut self, value: impl Into<IndexValue>) -> Self {
        self.lower = Bound::Included(value.into());
        self
    }

    pub fn lt(mut self, value: impl Into<IndexValue>) -> Self {
        self.upper = Bound::Excluded(value.into());
        self
    }

    pub fn lte(mut self, value: impl Into<IndexValue>) -> Self {
        self.upper = Bound::Included(value.into());
        self
    }

    /// Skip the first `n` matches.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Return at most `n` matches.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Walk the index in descending order.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Whether `value` lies within the query bounds.
    pub fn contains(&self, value: &IndexValue) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => value >= l,
            Bound::Excluded(l) => value > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => value <= u,
            Bound::Excluded(u) => value < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    fn paginate<T>(&self, matches: impl DoubleEndedIterator<Item = T>) -> Vec<T> {
        let limit = self.limit.unwrap_or(usize::MAX);
        if self.reverse {
            matches.rev().skip(self.skip).take(limit).collect()
        } else {
            matches.skip(self.skip).take(limit).collect()
        }
    }
}

/// The records of one store together with its materialized indexes.
#[derive(Debug, Clone, Default)]
struct Collection {
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, (IndexDef, BTreeSet<(IndexValue, Key)>)>,
}

impl Collection {
    fn new(def: Option<&StoreDef>) -> Self {
        let indexes = def
            .map(|d| d.all_indexes())
            .unwrap_or_default()
            .into_iter()
            .map(|i| (i.name.clone(), (i, BTreeSet::new())))
            .collect();
        Self {
            records: BTreeMap::new(),
            indexes,
        }
    }

    fn insert(&mut self, key: Key, value: Value) {
        self.remove(&key);
        for (def, entries) in self.indexes.values_mut() {
            if let Some(v) = def.extract(&value).and_then(IndexValue::from_value) {
                entries.insert((v, key.clone()));
            }
        }
        self.records.insert(key, value);
    }

    fn remove(&mut self, key: &Key) -> Option<Value> {
        let old = self.records.remove(key)?;
        for (def, entries) in self.indexes.values_mut() {
            if let Some(v) = def.extract(&old).and_then(IndexValue::from_value) {
                entries.remove(&(v, key.clone()));
            }
        }
        Some(old)
    }

    /// Query the collection as it looks with `overlay` (pending writes,
    /// `None` for deletes) applied on top.
    fn query(
        &self,
        store: &str,
        index: Option<&str>,
        query: &IndexQuery,
        overlay: Option<&WriteSet>,
    ) -> Result<Vec<Value>> {
        let shadowed = |k: &Key| overlay.is_some_and(|o| o.contains_key(k));
        let written = overlay
            .into_iter()
            .flatten()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)));
        match index {
            None => {
                let matches = self
                    .records
                    .iter()
                    .filter(|(k, _)| !shadowed(k))
                    .chain(written)
                    .filter(|(k, _)| query.contains(&IndexValue::from_key(k)));
                if overlay.is_none() {
                    return Ok(query.paginate(matches.map(|(_, v)| v.clone())));
                }
                let merged: BTreeMap<&Key, &Value> = matches.collect();
                Ok(query.paginate(merged.into_values().cloned()))
            }
            Some(name) => {
                let (def, entries) = self.indexes.get(name).ok_or_else(|| Error::IndexNotFound {
                    store: store.to_string(),
                    index: name.to_string(),
                })?;
                if overlay.is_none() {
                    let matches = entries
                        .iter()
                        .filter(|(v, _)| query.contains(v))
                        .filter_map(|(_, k)| self.records.get(k).cloned());
                    return Ok(query.paginate(matches));
                }
                let mut merged: BTreeMap<(IndexValue, &Key), &Value> = entries
                    .iter()
                    .filter(|(v, k)| query.contains(v) && !shadowed(k))
                    .filter_map(|(v, k)| self.records.get(k).map(|value| ((v.clone(), k), value)))
                    .collect();
                for (k, value) in written {
                    if let Some(v) = def.extract(value).and_then(IndexValue::from_value) {
                        if query.contains(&v) {
                            merged.insert((v, k), value);
                        }
                    }
                }
                Ok(query.paginate(merged.into_values().cloned()))
            }
        }
    }

    fn apply(&mut self, writes: WriteSet) {
        for (key, value) in writes {
            match value {
                Some(value) => self.insert(key, value),
                None => {
                    self.remove(&key);
                }
            }
        }
    }
}

/// Pending writes of one store within a transaction.
type WriteSet = BTreeMap<Key, Option<Value>>;

type Collections = BTreeMap<StoreName, Collection>;

/// In-memory local store.
///
/// Transactions are serialized: an open transaction holds the store lock until
/// it is committed or dropped. Writes are buffered per key and applied to the
/// records and indexes on commit.
#[derive(Debug)]
pub struct MemoryStore {
    schema: Schema,
    collections: Mutex<Collections>,
}

impl MemoryStore {
    /// Open an empty store for the given schema.
    pub fn new(schema: Schema) -> Result<Self> {
        schema.validate()?;
        let mut collections: Collections = schema
            .stores
            .values()
            .map(|def| (def.name.clone(), Collection::new(Some(def))))
            .collect();
        collections.insert(META_STORE.to_string(), Collection::new(None));
        Ok(Self {
            schema,
            collections: Mutex::new(collections),
        })
    }

    /// Open a store and load a previously exported snapshot into it.
    pub fn from_snapshot(schema: Schema, snapshot: StoreSnapshot) -> Result<Self> {
        let store = Self::new(schema)?;
        store.import_snapshot(snapshot)?;
        Ok(store)
    }

    /// Number of values in a store, tombstones included.
    pub fn len(&self, store: &str) -> Result<usize> {
        self.collections
            .lock()
            .get(store)
            .map(|c| c.records.len())
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))
    }

    /// Export every store as a snapshot with deterministic ordering.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        let collections = self.collections.lock();
        let mut snapshot = StoreSnapshot::new(self.schema.version);
        for (name, collection) in collections.iter() {
            for (key, value) in &collection.records {
                snapshot.add_entry(name, SnapshotEntry::new(key.clone(), value.clone()));
            }
        }
        snapshot
    }

    /// Replace the contents of every store with the snapshot's.
    ///
    /// Indexes are rebuilt from the imported values.
    pub fn import_snapshot(&self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;

        let mut fresh: Collections = self
            .schema
            .stores
            .values()
            .map(|def| (def.name.clone(), Collection::new(Some(def))))
            .collect();
        fresh.insert(META_STORE.to_string(), Collection::new(None));

        for (name, entries) in snapshot.stores {
            let collection = fresh
                .get_mut(&name)
                .ok_or_else(|| Error::StoreNotFound(name.clone()))?;
            for entry in entries {
                collection.insert(entry.key, entry.value);
            }
        }

        *self.collections.lock() = fresh;
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn transaction(&self, stores: &[&str], mode: TxMode) -> Result<Box<dyn Transaction + '_>> {
        let collections = self.collections.lock();
        for store in stores {
            if !collections.contains_key(*store) {
                return Err(Error::StoreNotFound(store.to_string()));
            }
        }
        Ok(Box::new(MemoryTransaction {
            collections,
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            writes: BTreeMap::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    collections: MutexGuard<'a, Collections>,
    scope: BTreeSet<StoreName>,
    mode: TxMode,
    /// Writes so far, applied to the collections on commit
    writes: BTreeMap<StoreName, WriteSet>,
}

impl MemoryTransaction<'_> {
    fn check_scope(&self, store: &str) -> Result<()> {
        if self.scope.contains(store) {
            Ok(())
        } else {
            Err(Error::StoreNotInTransaction(store.to_string()))
        }
    }

    fn read(&self, store: &str) -> Result<&Collection> {
        self.check_scope(store)?;
        self.collections
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))
    }

    fn write(&mut self, store: &str) -> Result<&mut WriteSet> {
        if self.mode == TxMode::ReadOnly {
            return Err(Error::ReadOnlyTransaction);
        }
        self.check_scope(store)?;
        Ok(self.writes.entry(store.to_string()).or_default())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        let collection = self.read(store)?;
        match self.writes.get(store).and_then(|w| w.get(key)) {
            Some(written) => Ok(written.clone()),
            None => Ok(collection.records.get(key).cloned()),
        }
    }

    fn put(&mut self, store: &str, key: Key, value: Value) -> Result<()> {
        self.write(store)?.insert(key, Some(value));
        Ok(())
    }

    fn delete(&mut self, store: &str, key: &Key) -> Result<()> {
        self.write(store)?.insert(key.clone(), None);
        Ok(())
    }

    fn query(&self, store: &str, index: Option<&str>, query: &IndexQuery) -> Result<Vec<Value>> {
        self.read(store)?
            .query(store, index, query, self.writes.get(store))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            mut collections,
            writes,
            ..
        } = *self;
        for (name, writes) in writes {
            if let Some(collection) = collections.get_mut(&name) {
                collection.apply(writes);
            }
        }
        Ok(())
    }
}
