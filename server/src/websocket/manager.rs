//! Connection registry.
//!
//! Tracks open sessions and which stores each of them asked to sync, so
//! accepted changes are only fanned out to sessions that requested them.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tether_engine::{Message, StoreName};
use tokio::sync::mpsc;

/// Sender for outgoing messages of one connection.
pub type MessageSender = mpsc::UnboundedSender<Message>;

/// A single open connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages open connections and their store subscriptions.
///
/// Thread-safe and can be shared across sessions via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All open connections, keyed by connection ID.
    pub(crate) connections: DashMap<String, Connection>,
    /// Connection IDs that requested changes, by store.
    subscriptions: DashMap<StoreName, HashSet<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection and return its ID.
    pub fn register(&self, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                sender,
            },
        );
        tracing::info!(conn_id = %conn_id, "Connection registered");
        conn_id
    }

    /// Drop a connection and all of its subscriptions.
    pub fn unregister(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            self.subscriptions.retain(|_, ids| {
                ids.remove(conn_id);
                !ids.is_empty()
            });
            tracing::info!(conn_id = %conn_id, "Connection unregistered");
        }
    }

    /// Add a connection to the fan-out of `store`.
    pub fn subscribe(&self, conn_id: &str, store: &str) {
        if !self.connections.contains_key(conn_id) {
            return;
        }
        let added = self
            .subscriptions
            .entry(store.to_string())
            .or_default()
            .insert(conn_id.to_string());
        if added {
            tracing::debug!(conn_id = %conn_id, store = %store, "Connection subscribed");
        }
    }

    /// Whether a connection is in the fan-out of `store`.
    pub fn is_subscribed(&self, conn_id: &str, store: &str) -> bool {
        self.subscriptions
            .get(store)
            .is_some_and(|ids| ids.contains(conn_id))
    }

    /// Send a message to every subscriber of `store` except `except`.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast(&self, store: &str, except: &str, message: &Message) -> usize {
        let recipients: Vec<String> = match self.subscriptions.get(store) {
            Some(ids) => ids.iter().filter(|id| *id != except).cloned().collect(),
            None => return 0,
        };

        let sent = recipients
            .iter()
            .filter(|id| self.send_to(id, message.clone()))
            .count();

        tracing::debug!(
            sender = %except,
            store = %store,
            recipients = sent,
            "Broadcast change to subscribers"
        );
        sent
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: Message) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections subscribed to `store`.
    pub fn subscriber_count(&self, store: &str) -> usize {
        self.subscriptions.get(store).map_or(0, |ids| ids.len())
    }
}
