//! Tracked reads and writes over several stores in one local transaction.

use super::{event, overwrite, read_record, write_record, ChangeTracker};
use crate::{
    error::Result,
    events::{ChangeEvent, ChangeKind},
    store::{IndexQuery, Transaction, TxMode},
    Error, Key, Origin, Record, StoreName,
};
use serde_json::Value;
use tracing::debug;

/// A local transaction whose writes are tracked for sync.
///
/// Handed out by [`ChangeTracker::read`] and [`ChangeTracker::write`]. Writes
/// follow the rules of the tracker's own `put` and `delete`; nothing is
/// visible to other readers, and no event is delivered, until the whole
/// transaction commits.
///
/// The local store is locked while the transaction is open, so the closure
/// must not call back into the tracker.
pub struct TrackedTransaction<'a> {
    tracker: &'a ChangeTracker,
    tx: Box<dyn Transaction + 'a>,
    events: Vec<ChangeEvent>,
    touched: Vec<(StoreName, Key)>,
    outbound: Vec<(StoreName, Record)>,
}

impl TrackedTransaction<'_> {
    /// Get active records by key; fails if any key is missing or deleted.
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

    pub fn get_one(&self, store: &str, key: &Key) -> Result<Value> {
        self.get(store, std::slice::from_ref(key))?
            .pop()
            .ok_or_else(|| Error::key_not_found(store, key))
    }

    /// Get records by key, tombstones included.
    pub fn get_including_deleted(&self, store: &str, keys: &[Key]) -> Result<Vec<Record>> {
        self.tracker.require_store(store)?;
        keys.iter()
            .map(|key| {
                read_record(self.tx.as_ref(), store, key)?
                    .ok_or_else(|| Error::key_not_found(store, key))
            })
            .collect()
    }

    /// Write records, returning their keys in order.
    pub fn put(&mut self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        let written = self.put_records(store, values)?;
        Ok(written.into_iter().map(|r| r.key).collect())
    }

    pub fn put_one(&mut self, store: &str, value: Value) -> Result<Key> {
        self.put(store, vec![value])?
            .pop()
            .ok_or_else(|| Error::InvalidRecord("nothing was written".into()))
    }

    /// Delete records by key. Records the server never saw are removed
    /// outright; the others become tombstones.
    pub fn delete(&mut self, store: &str, keys: &[Key]) -> Result<()> {
        self.tracker.require_store(store)?;
        for key in keys {
            let prior = match read_record(self.tx.as_ref(), store, key)? {
                Some(record) if record.is_active() => record,
                _ => return Err(Error::key_not_found(store, key)),
            };
            if prior.is_known_remotely() {
                let tombstone = prior.tombstone();
                write_record(self.tx.as_mut(), store, &tombstone)?;
                self.outbound.push((store.to_string(), tombstone));
            } else {
                self.tx.delete(store, key)?;
            }
            self.touched.push((store.to_string(), key.clone()));
            self.events
                .push(event(ChangeKind::Delete, store, &prior, Origin::Local));
        }
        Ok(())
    }

    /// Query active records through a secondary index.
    pub fn query(&self, store: &str, index: &str, query: &IndexQuery) -> Result<Vec<Value>> {
        self.query_records(store, Some(index), query)
    }

    pub fn all(&self, store: &str) -> Result<Vec<Value>> {
        self.query_records(store, None, &IndexQuery::all())
    }

    pub(super) fn query_records(
        &self,
        store: &str,
        index: Option<&str>,
        query: &IndexQuery,
    ) -> Result<Vec<Value>> {
        self.tracker.require_store(store)?;
        let mut views = Vec::new();
        for value in self.tx.query(store, index, query)? {
            let record = Record::from_stored(value)?;
            if record.is_active() {
                views.push(record.view());
            }
        }
        Ok(views)
    }

    /// Validate every value, then write them all.
    pub(super) fn put_records(&mut self, store: &str, values: Vec<Value>) -> Result<Vec<Record>> {
        self.tracker.require_store(store)?;
        let inputs = values
            .into_iter()
            .map(Record::parse_input)
            .collect::<Result<Vec<_>>>()?;

        let mut written = Vec::with_capacity(inputs.len());
        for (key, fields) in inputs {
            let key = key.unwrap_or_else(Key::generate);
            let (record, kind) = match read_record(self.tx.as_ref(), store, &key)? {
                None => (Record::new(key, fields), ChangeKind::Add),
                Some(prior) if prior.deleted => (overwrite(prior, fields), ChangeKind::Add),
                Some(prior) => (overwrite(prior, fields), ChangeKind::Update),
            };
            write_record(self.tx.as_mut(), store, &record)?;
            self.touched.push((store.to_string(), record.key.clone()));
            self.events.push(event(kind, store, &record, Origin::Local));
            self.outbound.push((store.to_string(), record.clone()));
            written.push(record);
        }
        debug!(store = %store, count = written.len(), "records written");
        Ok(written)
    }
}

impl ChangeTracker {
    /// Run `f` over a read-only transaction spanning `stores`.
    pub fn read<T>(
        &self,
        stores: &[&str],
        f: impl FnOnce(&TrackedTransaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.run(stores, TxMode::ReadOnly, false, |tx| f(tx))
    }

    /// Run `f` over a read-write transaction spanning `stores`.
    ///
    /// The writes commit together if `f` succeeds and are discarded if it
    /// fails. Change events follow the commit, and during continuous sync
    /// the written records are sent.
    pub fn write<T>(
        &self,
        stores: &[&str],
        f: impl FnOnce(&mut TrackedTransaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.run(stores, TxMode::ReadWrite, true, f)
    }

    pub(super) fn run<T>(
        &self,
        stores: &[&str],
        mode: TxMode,
        dispatch: bool,
        f: impl FnOnce(&mut TrackedTransaction<'_>) -> Result<T>,
    ) -> Result<T> {
        for store in stores {
            self.require_store(store)?;
        }
        let mut batch = TrackedTransaction {
            tracker: self,
            tx: self.store.transaction(stores, mode)?,
            events: Vec::new(),
            touched: Vec::new(),
            outbound: Vec::new(),
        };
        let value = f(&mut batch)?;

        let TrackedTransaction {
            tx,
            events,
            touched,
            outbound,
            ..
        } = batch;
        // In-flight records are flagged before the store lock is released.
        for (store, key) in &touched {
            self.mark_changed_since(store, key);
        }
        tx.commit()?;

        self.notify(events);
        if dispatch {
            for (store, record) in &outbound {
                self.dispatch(store, std::slice::from_ref(record))?;
            }
        }
        Ok(value)
    }
}
