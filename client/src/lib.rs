//! # Tether Client
//!
//! Keeps a local replica in sync with a Tether server.
//!
//! A [`Database`] wraps the engine's change tracker with sync sessions:
//! [`pull`](Database::pull) fetches and applies the server's changes,
//! [`push`](Database::push) sends pending local records,
//! [`sync`](Database::sync) does both, and
//! [`sync_continuously`](Database::sync_continuously) keeps forwarding local
//! changes and applying broadcasts until stopped. Only one session runs per
//! database at a time; starting another fails with [`Error::AlreadySyncing`].
//!
//! ```no_run
//! use serde_json::json;
//! use tether_client::{Database, WebSocketConnector};
//! use tether_engine::{Schema, StoreDef};
//!
//! # async fn run() -> tether_client::Result<()> {
//! let schema = Schema::new(1).with_store(StoreDef::new("roads"));
//! let db = Database::open(schema, WebSocketConnector::new("ws://localhost:8080/ws"))?;
//!
//! db.store("roads")?.put_one(json!({"length": 100}))?;
//! db.sync(&[]).await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod error;
pub mod join;
pub mod session;
pub mod transport;

pub use database::{ContinuousSync, Database, StoreHandle};
pub use error::{Error, Result};
pub use join::Join;
pub use session::SyncState;
pub use transport::{Channel, Connector, WebSocketConnector};
