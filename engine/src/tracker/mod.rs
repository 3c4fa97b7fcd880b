//! Record lifecycle and change tracking.
//!
//! The [`ChangeTracker`] wraps a [`LocalStore`] and keeps the sync metadata of
//! every record up to date: local writes mark records as pending and snapshot
//! the last state agreed with the server, deletes leave tombstones until the
//! server confirms them, and every committed change is announced to observers.

mod batch;
mod remote;

pub use batch::TrackedTransaction;
pub use remote::Applied;

use crate::{
    error::Result,
    events::{ChangeEvent, ChangeKind, Observers},
    resolve::{ConflictResolver, RejectHandler},
    schema::{Schema, CHANGED_INDEX, META_STORE},
    store::{IndexQuery, LocalStore, Transaction, TxMode},
    Change, Error, Fields, Key, Origin, Record, StoreName, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

const CLIENT_ID_KEY: &str = "clientId";

/// Receives local changes while continuous sync is running.
pub trait ChangeSink: Send + Sync {
    fn send(&self, change: Change);
}

/// A record sent to the server and not yet acknowledged.
#[derive(Debug, Clone)]
struct InFlight {
    /// Set when the record is written locally after being sent
    changed_since: bool,
    record: Record,
}

#[derive(Default)]
struct Hooks {
    resolvers: HashMap<StoreName, Arc<dyn ConflictResolver>>,
    reject_handlers: HashMap<StoreName, Arc<dyn RejectHandler>>,
    default_reject_handler: Option<Arc<dyn RejectHandler>>,
}

/// Tracks local changes to the records of a local store.
pub struct ChangeTracker {
    store: Arc<dyn LocalStore>,
    client_id: Mutex<Option<String>>,
    in_flight: Mutex<HashMap<(StoreName, Key), InFlight>>,
    /// Sent keys of in-flight records moved to another local key
    moved: Mutex<HashMap<(StoreName, Key), Key>>,
    hooks: RwLock<Hooks>,
    sink: RwLock<Option<Arc<dyn ChangeSink>>>,
    events: Observers<ChangeEvent>,
    store_events: BTreeMap<StoreName, Observers<ChangeEvent>>,
}

impl ChangeTracker {
    /// Track the stores declared by `store`'s schema.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        let store_events = store
            .schema()
            .store_names()
            .into_iter()
            .map(|name| (name, Observers::new()))
            .collect();
        Self {
            store,
            client_id: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            moved: Mutex::new(HashMap::new()),
            hooks: RwLock::new(Hooks::default()),
            sink: RwLock::new(None),
            events: Observers::new(),
            store_events,
        }
    }

    pub fn schema(&self) -> &Schema {
        self.store.schema()
    }

    fn require_store(&self, store: &str) -> Result<()> {
        self.schema().require_store(store).map(|_| ())
    }

    /// Get active records by key.
    ///
    /// Fails with [`Error::KeyNotFound`] if any key is missing or deleted.
    pub fn get(&self, store: &str, keys: &[Key]) -> Result<Vec<Value>> {
        self.get_including_deleted(store, keys)?
            .into_iter()
            .map(|record| {
                if record.is_active() {
                    Ok(record.view())
                } else {
                    Err(Error::key_not_found(store, &record.key))
                }
            })
            .collect()
    }

    /// Get one active record.
    pub fn get_one(&self, store: &str, key: &Key) -> Result<Value> {
        let mut records = self.get(store, std::slice::from_ref(key))?;
        records
            .pop()
            .ok_or_else(|| Error::key_not_found(store, key))
    }

    /// Get records by key, tombstones included, with their sync metadata.
    pub fn get_including_deleted(&self, store: &str, keys: &[Key]) -> Result<Vec<Record>> {
        self.read(&[store], |tx| tx.get_including_deleted(store, keys))
    }

    /// Write records. Records without a key get a generated one.
    ///
    /// All values are validated before anything is written.
    pub fn put(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        let written = self.put_records(store, values, true)?;
        Ok(written.into_iter().map(|r| r.key).collect())
    }

    /// Write one record and return its key.
    pub fn put_one(&self, store: &str, value: Value) -> Result<Key> {
        let mut keys = self.put(store, vec![value])?;
        keys.pop()
            .ok_or_else(|| Error::InvalidRecord("nothing was written".into()))
    }

    fn put_records(&self, store: &str, values: Vec<Value>, dispatch: bool) -> Result<Vec<Record>> {
        self.run(&[store], TxMode::ReadWrite, dispatch, |tx| {
            tx.put_records(store, values)
        })
    }

    /// Delete records by key.
    ///
    /// Records the server has never seen are removed outright; all others are
    /// replaced by tombstones until the delete is acknowledged.
    pub fn delete(&self, store: &str, keys: &[Key]) -> Result<()> {
        self.write(&[store], |tx| tx.delete(store, keys))
    }

    /// Query active records through a secondary index.
    pub fn query(&self, store: &str, index: &str, query: &IndexQuery) -> Result<Vec<Value>> {
        self.query_records(store, Some(index), query)
    }

    /// All active records of a store in key order.
    pub fn all(&self, store: &str) -> Result<Vec<Value>> {
        self.query_records(store, None, &IndexQuery::all())
    }

    fn query_records(
        &self,
        store: &str,
        index: Option<&str>,
        query: &IndexQuery,
    ) -> Result<Vec<Value>> {
        self.read(&[store], |tx| tx.query_records(store, index, query))
    }

    /// Records waiting to be pushed, tombstones included.
    pub fn pending(&self, store: &str) -> Result<Vec<Record>> {
        self.require_store(store)?;
        let tx = self.store.transaction(&[store], TxMode::ReadOnly)?;
        tx.query(store, Some(CHANGED_INDEX), &IndexQuery::only(1))?
            .into_iter()
            .map(Record::from_stored)
            .collect()
    }

    /// The identifier of this replica, generated and persisted on first use.
    pub fn client_id(&self) -> Result<String> {
        let mut cached = self.client_id.lock();
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let key = Key::from(CLIENT_ID_KEY);
        let mut tx = self.store.transaction(&[META_STORE], TxMode::ReadWrite)?;
        let stored = tx
            .get(META_STORE, &key)?
            .and_then(|v| v.get("clientId").and_then(Value::as_str).map(str::to_string));
        let id = match stored {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                tx.put(META_STORE, key, json!({ "clientId": id }))?;
                debug!(client_id = %id, "generated client id");
                id
            }
        };
        tx.commit()?;

        *cached = Some(id.clone());
        Ok(id)
    }

    /// Highest server timestamp applied for `store`.
    pub fn synced_to(&self, store: &str) -> Result<Option<Timestamp>> {
        self.require_store(store)?;
        let tx = self.store.transaction(&[META_STORE], TxMode::ReadOnly)?;
        read_synced_to(tx.as_ref(), store)
    }

    /// Register the conflict resolver of a store.
    pub fn set_conflict_resolver(
        &self,
        store: &str,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<()> {
        self.require_store(store)?;
        self.hooks
            .write()
            .resolvers
            .insert(store.to_string(), resolver);
        Ok(())
    }

    /// Register a reject handler for one store, or for the whole database when
    /// `store` is `None`.
    pub fn set_reject_handler(
        &self,
        store: Option<&str>,
        handler: Arc<dyn RejectHandler>,
    ) -> Result<()> {
        let mut hooks = self.hooks.write();
        match store {
            Some(store) => {
                self.require_store(store)?;
                hooks.reject_handlers.insert(store.to_string(), handler);
            }
            None => hooks.default_reject_handler = Some(handler),
        }
        Ok(())
    }

    /// Route local changes to `sink` as they are committed, or stop doing so.
    pub fn set_sink(&self, sink: Option<Arc<dyn ChangeSink>>) {
        *self.sink.write() = sink;
    }

    /// Observers of changes to any store.
    pub fn events(&self) -> &Observers<ChangeEvent> {
        &self.events
    }

    /// Observers of changes to one store.
    pub fn store_events(&self, store: &str) -> Result<&Observers<ChangeEvent>> {
        self.store_events
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))
    }

    /// Build the change that pushes `record` and remember it as in flight.
    ///
    /// Returns `None` if the record is already in flight; it is then flagged so
    /// the acknowledgment leaves it pending.
    pub fn outbound(&self, store: &str, record: &Record) -> Result<Option<Change>> {
        let client_id = self.client_id()?;
        let mut in_flight = self.in_flight.lock();
        let slot = (store.to_string(), record.key.clone());
        if let Some(sent) = in_flight.get_mut(&slot) {
            sent.changed_since = true;
            return Ok(None);
        }
        let change = Change::from_record(store, record, Some(&client_id))?;
        in_flight.insert(
            slot,
            InFlight {
                changed_since: false,
                record: record.clone(),
            },
        );
        Ok(Some(change))
    }

    /// Build the changes for every pending record of `stores`.
    pub fn outbound_pending(&self, stores: &[StoreName]) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for store in stores {
            for record in self.pending(store)? {
                if let Some(change) = self.outbound(store, &record)? {
                    changes.push(change);
                }
            }
        }
        Ok(changes)
    }

    /// Forget all unacknowledged sends, e.g. after the connection dropped.
    pub fn reset_in_flight(&self) {
        self.in_flight.lock().clear();
        self.moved.lock().clear();
    }

    /// Number of records sent and not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn mark_changed_since(&self, store: &str, key: &Key) {
        if let Some(sent) = self
            .in_flight
            .lock()
            .get_mut(&(store.to_string(), key.clone()))
        {
            sent.changed_since = true;
        }
    }

    /// Follow an in-flight record from `from` to its new local key `to`.
    fn move_in_flight(&self, store: &str, from: &Key, to: &Key) {
        let mut in_flight = self.in_flight.lock();
        if let Some(sent) = in_flight.remove(&(store.to_string(), from.clone())) {
            in_flight.insert((store.to_string(), to.clone()), sent);
            self.moved
                .lock()
                .insert((store.to_string(), from.clone()), to.clone());
        }
    }

    /// The local key of the record sent under `sent`.
    fn local_key(&self, store: &str, sent: &Key) -> Key {
        self.moved
            .lock()
            .remove(&(store.to_string(), sent.clone()))
            .unwrap_or_else(|| sent.clone())
    }

    fn notify(&self, events: Vec<ChangeEvent>) {
        for event in events {
            if let Some(observers) = self.store_events.get(&event.store) {
                observers.notify(&event);
            }
            self.events.notify(&event);
        }
    }

    fn dispatch(&self, store: &str, records: &[Record]) -> Result<()> {
        let sink = match self.sink.read().clone() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        for record in records {
            if let Some(change) = self.outbound(store, record)? {
                sink.send(change);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("stores", &self.store_events.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

/// Replace the fields of a stored record after a local write.
fn overwrite(prior: Record, fields: Fields) -> Record {
    let remote_original = if prior.changed_since_sync {
        prior.remote_original
    } else {
        Some(prior.fields)
    };
    Record {
        key: prior.key,
        version: prior.version,
        changed_since_sync: true,
        deleted: false,
        remote_original,
        fields,
    }
}

fn event(kind: ChangeKind, store: &str, record: &Record, origin: Origin) -> ChangeEvent {
    ChangeEvent {
        kind,
        store: store.to_string(),
        key: record.key.clone(),
        record: Some(record.view()),
        origin,
    }
}

fn read_record(tx: &(dyn Transaction + '_), store: &str, key: &Key) -> Result<Option<Record>> {
    tx.get(store, key)?.map(Record::from_stored).transpose()
}

fn write_record(tx: &mut (dyn Transaction + '_), store: &str, record: &Record) -> Result<()> {
    tx.put(store, record.key.clone(), record.to_stored()?)
}

fn synced_to_key(store: &str) -> Key {
    Key::Str(format!("syncedTo:{}", store))
}

fn read_synced_to(tx: &(dyn Transaction + '_), store: &str) -> Result<Option<Timestamp>> {
    Ok(tx
        .get(META_STORE, &synced_to_key(store))?
        .and_then(|v| v.get("syncedTo").and_then(Value::as_u64)))
}

fn write_synced_to(
    tx: &mut (dyn Transaction + '_),
    store: &str,
    timestamp: Timestamp,
) -> Result<()> {
    tx.put(
        META_STORE,
        synced_to_key(store),
        json!({ "storeName": store, "syncedTo": timestamp }),
    )
}
