//! Message handlers.
//!
//! Every incoming message is dispatched by its `type` through the
//! connection's [`HandlerTable`]. The table starts out as a copy of the
//! server's base table, which defaults to the built-in protocol handlers, and
//! can be changed per connection. A replacement handler can still run the
//! built-in behavior through [`Context::call_default`].

mod defaults;
pub mod websocket;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tether_engine::Message;
use tokio::sync::{OwnedMutexGuard, RwLock, RwLockWriteGuard};

use crate::error::{AppError, Result};
use crate::persistence::ChangeLog;
use crate::server::SyncServer;

pub use defaults::{handle_change, handle_connect, handle_get_changes, handle_reset};

/// Handles one type of message for a connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: Context, message: Message) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Context, message: Message) -> Result<()> {
        (self)(ctx, message).await
    }
}

/// Handlers by message type.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    /// A table with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in protocol handlers.
    pub fn defaults() -> Self {
        let mut table = Self::new();
        table.set("create", handle_change);
        table.set("update", handle_change);
        table.set("delete", handle_change);
        table.set("get-changes", handle_get_changes);
        table.set("reset", handle_reset);
        table.set("connect", handle_connect);
        table
    }

    /// Install a handler, returning the one it replaces.
    pub fn set(
        &mut self,
        kind: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(kind.into(), Arc::new(handler))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn remove(&mut self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.remove(kind)
    }

    /// The message types with a handler, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// What a handler can do on behalf of its connection.
#[derive(Clone)]
pub struct Context {
    conn_id: Arc<str>,
    server: Arc<SyncServer>,
    handlers: Arc<RwLock<HandlerTable>>,
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub(crate) fn new(conn_id: String, server: Arc<SyncServer>, handlers: HandlerTable) -> Self {
        Self {
            conn_id: conn_id.into(),
            server,
            handlers: Arc::new(RwLock::new(handlers)),
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Send a message to this connection.
    pub fn respond(&self, message: Message) -> bool {
        self.server.connections().send_to(&self.conn_id, message)
    }

    /// Send a message to every other connection that pulled `store`.
    pub fn broadcast(&self, store: &str, message: &Message) -> usize {
        self.server.connections().broadcast(store, &self.conn_id, message)
    }

    /// Add this connection to the fan-out of `store`.
    pub fn subscribe(&self, store: &str) {
        self.server.connections().subscribe(&self.conn_id, store);
    }

    pub fn log(&self) -> &Arc<dyn ChangeLog> {
        self.server.log()
    }

    /// Per-connection values, e.g. the identity established by a custom
    /// authentication message.
    pub fn data(&self) -> &DashMap<String, Value> {
        &self.data
    }

    /// This connection's handler table.
    pub async fn handlers_mut(&self) -> RwLockWriteGuard<'_, HandlerTable> {
        self.handlers.write().await
    }

    /// Run the built-in handler for `message`.
    pub async fn call_default(&self, message: Message) -> Result<()> {
        let handler = HandlerTable::defaults()
            .get(message.kind())
            .ok_or_else(|| {
                AppError::BadRequest(format!("no built-in handler for '{}'", message.kind()))
            })?;
        handler.handle(self.clone(), message).await
    }

    /// Hold the write lock of `store` on the server.
    pub async fn lock_store(&self, store: &str) -> OwnedMutexGuard<()> {
        self.server.lock_store(store).await
    }

    /// Dispatch an incoming message to the handler for its type.
    ///
    /// A failed change or pull is answered with a reject naming its store, and
    /// the key for changes; other failures are only logged.
    pub async fn dispatch(&self, message: Message) {
        let kind = message.kind().to_string();
        let handler = self.handlers.read().await.get(&kind);
        let handler = match handler {
            Some(handler) => handler,
            None => {
                tracing::warn!(conn_id = %self.conn_id, kind = %kind, "No handler for message type");
                return;
            }
        };

        let store = message.store_name().map(str::to_string);
        let key = match &message {
            Message::Change(change) => Some(change.key().clone()),
            _ => None,
        };
        tracing::debug!(conn_id = %self.conn_id, kind = %kind, "Handling message");

        if let Err(e) = handler.handle(self.clone(), message).await {
            tracing::error!(conn_id = %self.conn_id, kind = %kind, store = ?store, "Handler failed: {}", e);
            if store.is_some() && matches!(kind.as_str(), "create" | "update" | "delete" | "get-changes") {
                self.respond(Message::reject(store, key, e.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}
