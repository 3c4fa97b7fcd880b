//! Application-facing database API.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tether_engine::{
    ChangeEvent, ChangeTracker, ConflictResolver, IndexQuery, Key, LocalStore, MemoryStore,
    Message, Observers, RejectHandler, Schema, SendingChanges, StoreName, TrackedTransaction,
};

use crate::error::{Error, Result};
use crate::session::{Inner, SyncGuard, SyncState};
use crate::transport::Connector;

/// A local replica of a set of stores, synced with a server.
///
/// Cloning is cheap; clones share the replica and its sync session.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open an in-memory replica of `schema`.
    pub fn open(schema: Schema, connector: impl Connector + 'static) -> Result<Self> {
        let store = MemoryStore::new(schema)?;
        Ok(Self::with_store(Arc::new(store), Arc::new(connector)))
    }

    /// Open a replica over any local store.
    pub fn with_store(store: Arc<dyn LocalStore>, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner::new(ChangeTracker::new(store), connector)),
        }
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.inner.tracker
    }

    /// Handle for one store.
    pub fn store(&self, name: &str) -> Result<StoreHandle<'_>> {
        self.tracker().schema().require_store(name)?;
        Ok(StoreHandle {
            db: self,
            name: name.to_string(),
        })
    }

    /// Read several stores in one local transaction.
    pub fn read<T>(
        &self,
        stores: &[&str],
        f: impl FnOnce(&TrackedTransaction<'_>) -> tether_engine::Result<T>,
    ) -> Result<T> {
        Ok(self.tracker().read(stores, f)?)
    }

    /// Write to several stores in one local transaction.
    ///
    /// Either every write commits or none does. Events are delivered after
    /// the commit, and a running continuous sync sends the changes.
    pub fn write<T>(
        &self,
        stores: &[&str],
        f: impl FnOnce(&mut TrackedTransaction<'_>) -> tether_engine::Result<T>,
    ) -> Result<T> {
        Ok(self.tracker().write(stores, f)?)
    }

    /// Changes to any store.
    pub fn events(&self) -> &Observers<ChangeEvent> {
        self.tracker().events()
    }

    /// Headers announcing how many changes the server is about to send.
    pub fn sync_initiated(&self) -> &Observers<SendingChanges> {
        &self.inner.sync_initiated
    }

    /// Application messages without a known `storeName`.
    pub fn messages(&self) -> &Observers<Value> {
        &self.inner.messages
    }

    /// Handle rejects for stores without their own handler.
    pub fn on_reject(&self, handler: impl RejectHandler + 'static) -> Result<()> {
        self.tracker().set_reject_handler(None, Arc::new(handler))?;
        Ok(())
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_state() != SyncState::Idle
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Open a connection that stays up across sync sessions, e.g. to exchange
    /// application messages.
    pub async fn connect(&self) -> Result<()> {
        self.inner.ensure_link(true).await?;
        Ok(())
    }

    pub fn disconnect(&self) {
        self.inner.close_link(true);
    }

    /// Send a message over the open connection.
    pub fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message)
    }

    /// Fetch and apply the server's changes for `stores`; all stores when empty.
    pub async fn pull(&self, stores: &[&str]) -> Result<()> {
        let stores = self.resolve(stores)?;
        let mut guard = self.inner.begin()?;
        guard.connect().await?;
        guard.inner().pull(&stores).await
    }

    /// Send the pending records of `stores`; all stores when empty.
    pub async fn push(&self, stores: &[&str]) -> Result<()> {
        let stores = self.resolve(stores)?;
        let mut guard = self.inner.begin()?;
        guard.connect().await?;
        guard.inner().push(&stores).await
    }

    /// Pull, then push.
    pub async fn sync(&self, stores: &[&str]) -> Result<()> {
        let stores = self.resolve(stores)?;
        let mut guard = self.inner.begin()?;
        guard.connect().await?;
        guard.inner().pull(&stores).await?;
        guard.inner().push(&stores).await
    }

    /// Sync, then keep forwarding local changes and applying the server's
    /// broadcasts until the returned handle is stopped or dropped.
    pub async fn sync_continuously(&self, stores: &[&str]) -> Result<ContinuousSync> {
        let stores = self.resolve(stores)?;
        let mut guard = self.inner.begin()?;
        guard.connect().await?;
        guard.inner().forward_local_changes();
        guard.inner().pull(&stores).await?;
        guard.inner().push(&stores).await?;
        guard.inner().set_state(SyncState::Continuous);
        Ok(ContinuousSync { guard })
    }

    fn resolve(&self, stores: &[&str]) -> Result<Vec<StoreName>> {
        let schema = self.tracker().schema();
        if stores.is_empty() {
            return Ok(schema.store_names());
        }
        let mut seen = BTreeSet::new();
        let mut names = Vec::with_capacity(stores.len());
        for store in stores {
            schema.require_store(store)?;
            if seen.insert(*store) {
                names.push(store.to_string());
            }
        }
        Ok(names)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("tracker", &self.inner.tracker)
            .field("state", &self.sync_state())
            .finish()
    }
}

/// A running continuous sync.
pub struct ContinuousSync {
    guard: SyncGuard,
}

impl ContinuousSync {
    /// The first error since the sync started, if any.
    pub fn error(&self) -> Option<Error> {
        self.guard.inner().session_error()
    }

    /// Wait until every change sent so far has been answered.
    pub async fn flush(&self) -> Result<()> {
        self.guard.inner().flush().await
    }

    /// Stop syncing and return the first error encountered while running.
    pub fn stop(self) -> Result<()> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ContinuousSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousSync")
            .field("error", &self.error())
            .finish()
    }
}

/// One store of a [`Database`].
#[derive(Debug, Clone)]
pub struct StoreHandle<'a> {
    db: &'a Database,
    name: StoreName,
}

impl StoreHandle<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get records by key; fails if any key is missing or deleted.
    pub fn get(&self, keys: &[Key]) -> Result<Vec<Value>> {
        Ok(self.db.tracker().get(&self.name, keys)?)
    }

    pub fn get_one(&self, key: &Key) -> Result<Value> {
        Ok(self.db.tracker().get_one(&self.name, key)?)
    }

    /// Write records, returning their keys in order.
    pub fn put(&self, values: Vec<Value>) -> Result<Vec<Key>> {
        Ok(self.db.tracker().put(&self.name, values)?)
    }

    pub fn put_one(&self, value: Value) -> Result<Key> {
        Ok(self.db.tracker().put_one(&self.name, value)?)
    }

    pub fn delete(&self, keys: &[Key]) -> Result<()> {
        Ok(self.db.tracker().delete(&self.name, keys)?)
    }

    pub fn query(&self, index: &str, query: &IndexQuery) -> Result<Vec<Value>> {
        Ok(self.db.tracker().query(&self.name, index, query)?)
    }

    pub fn all(&self) -> Result<Vec<Value>> {
        Ok(self.db.tracker().all(&self.name)?)
    }

    /// Changes to this store.
    pub fn events(&self) -> Result<&Observers<ChangeEvent>> {
        Ok(self.db.tracker().store_events(&self.name)?)
    }

    /// Application messages naming this store.
    pub fn messages(&self) -> Result<&Observers<Value>> {
        self.db
            .inner
            .store_messages
            .get(&self.name)
            .ok_or_else(|| tether_engine::Error::StoreNotFound(self.name.clone()).into())
    }

    pub fn on_conflict(&self, resolver: impl ConflictResolver + 'static) -> Result<()> {
        Ok(self
            .db
            .tracker()
            .set_conflict_resolver(&self.name, Arc::new(resolver))?)
    }

    pub fn on_reject(&self, handler: impl RejectHandler + 'static) -> Result<()> {
        Ok(self
            .db
            .tracker()
            .set_reject_handler(Some(&self.name), Arc::new(handler))?)
    }

    pub async fn pull(&self) -> Result<()> {
        self.db.pull(&[self.name.as_str()]).await
    }

    pub async fn push(&self) -> Result<()> {
        self.db.push(&[self.name.as_str()]).await
    }

    pub async fn sync(&self) -> Result<()> {
        self.db.sync(&[self.name.as_str()]).await
    }
}
