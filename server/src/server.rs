//! The sync server: change log, connections and handlers.

use std::sync::Arc;

use dashmap::DashMap;
use tether_engine::{Message, StoreName};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::handlers::{Context, HandlerTable};
use crate::persistence::ChangeLog;
use crate::websocket::{ConnectionManager, MessageSender};

/// Shared state of all sessions.
///
/// Writes to a store and pulls of that store hold the store's lock, so a
/// session that pulled never receives a broadcast ahead of its stream.
pub struct SyncServer {
    log: Arc<dyn ChangeLog>,
    connections: Arc<ConnectionManager>,
    handlers: HandlerTable,
    locks: DashMap<StoreName, Arc<Mutex<()>>>,
}

impl SyncServer {
    /// A server using the built-in handlers.
    pub fn new(log: Arc<dyn ChangeLog>) -> Self {
        Self {
            log,
            connections: ConnectionManager::new_shared(),
            handlers: HandlerTable::defaults(),
            locks: DashMap::new(),
        }
    }

    /// Replace the table every new connection starts with.
    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn log(&self) -> &Arc<dyn ChangeLog> {
        &self.log
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub(crate) async fn lock_store(&self, store: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(store.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Register a connection whose outgoing messages go to `outbound` and
    /// deliver the synthetic `connect` message to its handlers.
    pub async fn open_session(self: &Arc<Self>, outbound: MessageSender) -> Session {
        let conn_id = self.connections.register(outbound);
        let ctx = Context::new(conn_id, Arc::clone(self), self.handlers.clone());
        ctx.dispatch(Message::Connect).await;
        Session { ctx }
    }

    /// Open an in-process session.
    ///
    /// Returns the sender for messages to the server and the receiver for
    /// its replies. The session ends when the sender is dropped.
    pub fn connect_local(
        self: &Arc<Self>,
    ) -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let session = server.open_session(out_tx).await;
            while let Some(message) = in_rx.recv().await {
                session.dispatch(message).await;
            }
        });
        (in_tx, out_rx)
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("connections", &self.connections.connection_count())
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// One open connection. Unregisters itself when dropped.
#[derive(Debug)]
pub struct Session {
    ctx: Context,
}

impl Session {
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn conn_id(&self) -> &str {
        self.ctx.conn_id()
    }

    /// Handle one incoming message.
    pub async fn dispatch(&self, message: Message) {
        self.ctx.dispatch(message).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.ctx.server().connections().unregister(self.ctx.conn_id());
    }
}
