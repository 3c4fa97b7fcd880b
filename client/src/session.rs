//! Sync session state machine.
//!
//! A database holds at most one session at a time. The session owns two
//! barriers: one counting the stores whose pull has not finished yet, one
//! counting the changes sent and not yet answered. Replies are processed by
//! the connection's reader task, which applies them to the change tracker and
//! marks completions on the running session.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tether_engine::{
    Ack, Change, ChangeSink, ChangeTracker, GetChanges, Message, Observers, Reject,
    SendingChanges, StoreName,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::join::Join;
use crate::transport::{Channel, Connector};

/// Where a database is in its sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Connecting,
    Pulling,
    Pushing,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pull {
    AwaitingHeader,
    Receiving(usize),
}

struct Session {
    state: SyncState,
    /// Requested stores in request order
    pulls: Vec<(StoreName, Pull)>,
    pull_join: Join,
    push_join: Join,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SyncState::Connecting,
            pulls: Vec::new(),
            pull_join: Join::new(0),
            push_join: Join::new(0),
        }
    }

    fn fail(&self, error: Error) {
        self.pull_join.fail(error.clone());
        self.push_join.fail(error);
    }
}

struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    /// Opened through `Database::connect`; outlives sessions
    explicit: bool,
}

pub(crate) struct Inner {
    pub(crate) tracker: ChangeTracker,
    connector: Arc<dyn Connector>,
    link: Mutex<Option<Link>>,
    next_link: AtomicU64,
    syncing: AtomicBool,
    session: Mutex<Option<Session>>,
    pub(crate) messages: Observers<Value>,
    pub(crate) store_messages: BTreeMap<StoreName, Observers<Value>>,
    pub(crate) sync_initiated: Observers<SendingChanges>,
}

impl Inner {
    pub(crate) fn new(tracker: ChangeTracker, connector: Arc<dyn Connector>) -> Self {
        let store_messages = tracker
            .schema()
            .store_names()
            .into_iter()
            .map(|name| (name, Observers::new()))
            .collect();
        Self {
            tracker,
            connector,
            link: Mutex::new(None),
            next_link: AtomicU64::new(1),
            syncing: AtomicBool::new(false),
            session: Mutex::new(None),
            messages: Observers::new(),
            store_messages,
            sync_initiated: Observers::new(),
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        self.session
            .lock()
            .as_ref()
            .map_or(SyncState::Idle, |s| s.state)
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        if let Some(session) = self.session.lock().as_mut() {
            session.state = state;
        }
    }

    /// Start a session, failing if one is already running.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<SyncGuard> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadySyncing);
        }
        self.tracker.reset_in_flight();
        *self.session.lock() = Some(Session::new());
        Ok(SyncGuard {
            inner: Arc::clone(self),
            opened_link: false,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.tx.is_closed())
    }

    /// Make sure a connection is open. Returns true if this call opened it.
    pub(crate) async fn ensure_link(self: &Arc<Self>, explicit: bool) -> Result<bool> {
        {
            let mut link = self.link.lock();
            if let Some(open) = link.as_mut().filter(|l| !l.tx.is_closed()) {
                open.explicit |= explicit;
                return Ok(false);
            }
        }

        let Channel { tx, rx } = self.connector.connect().await?;
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let reader = tokio::spawn(read_loop(Arc::downgrade(self), id, rx));
        let replaced = self.link.lock().replace(Link {
            id,
            tx,
            reader,
            explicit,
        });
        if let Some(old) = replaced {
            old.reader.abort();
        }
        debug!(link = id, "connection opened");
        Ok(true)
    }

    /// Close the connection. Unless `force`, a connection opened explicitly stays open.
    pub(crate) fn close_link(&self, force: bool) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|l| force || !l.explicit) {
            if let Some(closed) = link.take() {
                closed.reader.abort();
                debug!(link = closed.id, "connection closed");
            }
        }
    }

    pub(crate) fn send(&self, message: Message) -> Result<()> {
        let link = self.link.lock();
        let link = link.as_ref().ok_or(Error::Disconnected)?;
        link.tx.send(message).map_err(|_| Error::Disconnected)
    }

    /// Pull `stores` and wait until every store's stream was applied.
    pub(crate) async fn pull(&self, stores: &[StoreName]) -> Result<()> {
        let join = {
            let mut session = self.session.lock();
            let session = session.as_mut().ok_or(Error::Disconnected)?;
            session.state = SyncState::Pulling;
            session.pulls = stores
                .iter()
                .map(|store| (store.clone(), Pull::AwaitingHeader))
                .collect();
            session.pull_join = Join::new(stores.len());
            session.pull_join.clone()
        };

        let client_id = self.tracker.client_id()?;
        for store in stores {
            let since = self.tracker.synced_to(store)?;
            debug!(store = %store, since = ?since, "requesting changes");
            self.send(Message::GetChanges(GetChanges {
                store_name: store.clone(),
                since,
                client_id: Some(client_id.clone()),
            }))?;
        }
        join.wait().await
    }

    /// Push the pending records of `stores` and wait for every reply.
    pub(crate) async fn push(&self, stores: &[StoreName]) -> Result<()> {
        let join = {
            let mut session = self.session.lock();
            let session = session.as_mut().ok_or(Error::Disconnected)?;
            session.state = SyncState::Pushing;
            session.push_join.clone()
        };

        let changes = self.tracker.outbound_pending(stores)?;
        debug!(count = changes.len(), "pushing changes");
        join.add(changes.len());
        for change in changes {
            self.send(Message::Change(change))?;
        }
        join.wait().await
    }

    /// Forward local changes as they are committed until the session ends.
    pub(crate) fn forward_local_changes(self: &Arc<Self>) {
        self.tracker.set_sink(Some(Arc::new(LinkSink {
            inner: Arc::downgrade(self),
        })));
    }

    /// Wait for replies to every change sent in this session.
    pub(crate) async fn flush(&self) -> Result<()> {
        let join = self.push_join().ok_or(Error::Disconnected)?;
        join.wait().await
    }

    /// The first error of the running session.
    pub(crate) fn session_error(&self) -> Option<Error> {
        let session = self.session.lock();
        let session = session.as_ref()?;
        session.push_join.error().or_else(|| session.pull_join.error())
    }

    fn push_join(&self) -> Option<Join> {
        self.session.lock().as_ref().map(|s| s.push_join.clone())
    }

    fn fail(&self, error: Error) {
        match self.session.lock().as_ref() {
            Some(session) => session.fail(error),
            None => error!("sync error outside of a session: {}", error),
        }
    }

    fn handle(&self, message: Message) {
        match message {
            Message::SendingChanges(header) => self.on_header(header),
            Message::Change(change) => self.on_change(change),
            Message::Ok(ack) => self.on_ack(ack),
            Message::Reject(reject) => self.on_reject(reject),
            Message::Custom(value) => self.on_custom(value),
            Message::Reset => debug!("server change log was reset"),
            other => warn!(kind = %other.kind(), "ignoring unexpected message"),
        }
    }

    fn on_header(&self, header: SendingChanges) {
        self.sync_initiated.notify(&header);

        let mut session = self.session.lock();
        let session = match session.as_mut() {
            Some(session) => session,
            None => {
                warn!("sending-changes outside of a session");
                return;
            }
        };
        // Without a store name the header answers the oldest open request.
        let slot = session.pulls.iter().position(|(store, pull)| {
            *pull == Pull::AwaitingHeader
                && header.store_name.as_ref().map_or(true, |name| name == store)
        });
        let index = match slot {
            Some(index) => index,
            None => {
                warn!(store = ?header.store_name, "unexpected sending-changes");
                return;
            }
        };
        debug!(store = %session.pulls[index].0, count = header.nr_of_records_to_sync, "receiving changes");
        if header.nr_of_records_to_sync == 0 {
            session.pulls.remove(index);
            session.pull_join.done();
        } else {
            session.pulls[index].1 = Pull::Receiving(header.nr_of_records_to_sync);
        }
    }

    fn on_change(&self, change: Change) {
        if let Err(e) = self.tracker.apply_remote(&change) {
            error!(store = %change.store_name(), key = %change.key(), "failed to apply remote change: {}", e);
            self.fail(e.into());
        }

        let mut session = self.session.lock();
        let session = match session.as_mut() {
            Some(session) => session,
            None => return,
        };
        let store = change.store_name();
        let slot = session
            .pulls
            .iter()
            .position(|(name, pull)| name == store && matches!(pull, Pull::Receiving(_)));
        if let Some(index) = slot {
            match session.pulls[index].1 {
                Pull::Receiving(1) => {
                    session.pulls.remove(index);
                    session.pull_join.done();
                }
                Pull::Receiving(n) => session.pulls[index].1 = Pull::Receiving(n - 1),
                Pull::AwaitingHeader => {}
            }
        }
    }

    fn on_ack(&self, ack: Ack) {
        match self.tracker.acknowledge(&ack) {
            Ok(Some(record)) => self.resend(&ack.store_name, |tracker| {
                tracker.outbound(&ack.store_name, &record)
            }),
            Ok(None) => {}
            Err(e) => {
                error!(store = %ack.store_name, key = %ack.key, "failed to apply acknowledgment: {}", e);
                self.fail(e.into());
            }
        }
        if let Some(join) = self.push_join() {
            join.done();
        }
    }

    fn on_reject(&self, reject: Reject) {
        if reject.key.is_none() {
            if let Some(store) = &reject.store_name {
                if self.fail_pull(store, &reject.description) {
                    return;
                }
            }
        }

        let store = reject.store_name.clone().unwrap_or_default();
        self.resend(&store, |tracker| tracker.reject(&reject));
        if reject.key.is_some() {
            if let Some(join) = self.push_join() {
                join.done();
            }
        }
    }

    /// Send the change built by `build` as part of the running session.
    ///
    /// Without a session the record stays pending for the next push.
    fn resend<F>(&self, store: &str, build: F)
    where
        F: FnOnce(&ChangeTracker) -> tether_engine::Result<Option<Change>>,
    {
        match build(&self.tracker) {
            Ok(Some(change)) => {
                let join = match self.push_join() {
                    Some(join) => join,
                    None => {
                        debug!(store = %store, key = %change.key(), "no session, change left pending");
                        return;
                    }
                };
                debug!(store = %store, key = %change.key(), "resending change");
                join.add(1);
                if let Err(e) = self.send(Message::Change(change)) {
                    self.fail(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(store = %store, "failed to prepare resend: {}", e);
                self.fail(e.into());
            }
        }
    }

    fn fail_pull(&self, store: &str, description: &str) -> bool {
        let session = self.session.lock();
        let session = match session.as_ref() {
            Some(session) => session,
            None => return false,
        };
        let pulling = session
            .pulls
            .iter()
            .any(|(name, pull)| name == store && *pull == Pull::AwaitingHeader);
        if pulling {
            session.pull_join.fail(Error::PullRejected {
                store: store.to_string(),
                description: description.to_string(),
            });
        }
        pulling
    }

    fn on_custom(&self, value: Value) {
        let observers = value
            .get("storeName")
            .and_then(Value::as_str)
            .and_then(|store| self.store_messages.get(store))
            .unwrap_or(&self.messages);
        observers.notify(&value);
    }

    fn link_closed(&self, id: u64) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|l| l.id == id) {
            link.take();
            drop(link);
            warn!(link = id, "connection lost");
            if let Some(session) = self.session.lock().as_ref() {
                session.fail(Error::Disconnected);
            }
        }
    }
}

async fn read_loop(inner: Weak<Inner>, id: u64, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let kind = message.kind().to_string();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| inner.handle(message))) {
            let reason = panic_message(panic.as_ref());
            error!(link = id, kind = %kind, "message handling panicked: {}", reason);
            inner.fail(Error::Panicked(reason));
            inner.link_closed(id);
            return;
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.link_closed(id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Sends local changes over the open connection during continuous sync.
struct LinkSink {
    inner: Weak<Inner>,
}

impl ChangeSink for LinkSink {
    fn send(&self, change: Change) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if let Some(join) = inner.push_join() {
            join.add(1);
        }
        debug!(store = %change.store_name(), key = %change.key(), "forwarding local change");
        if let Err(e) = inner.send(Message::Change(change)) {
            inner.fail(e);
        }
    }
}

/// Marks a database as syncing. Ends the session when dropped.
pub(crate) struct SyncGuard {
    inner: Arc<Inner>,
    opened_link: bool,
}

impl SyncGuard {
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Connect for this session, remembering whether the session opened the link.
    pub(crate) async fn connect(&mut self) -> Result<()> {
        self.opened_link |= self.inner.ensure_link(false).await?;
        Ok(())
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.inner.tracker.set_sink(None);
        *self.inner.session.lock() = None;
        if self.opened_link {
            self.inner.close_link(false);
        }
        self.inner.syncing.store(false, Ordering::Release);
    }
}
