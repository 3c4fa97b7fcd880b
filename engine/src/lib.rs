//! # Tether Engine
//!
//! Record tracking, structural diffs and the wire protocol of an offline-first
//! sync system.
//!
//! This crate holds everything a Tether client and server share: the record
//! model, the diff/patch codec used to ship updates, the change messages, and
//! the change tracker that keeps a local replica's sync metadata consistent.
//! It performs no network IO; the `tether-client` crate drives a
//! [`ChangeTracker`] over a connection and `tether-server` keeps the
//! authoritative change log.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is an application object (its [`Fields`]) plus sync metadata:
//! - Primary [`Key`], an integer or a string
//! - Server version, absent until first acknowledged
//! - `changedSinceSync` flag, indexed so pending records are cheap to find
//! - Tombstone flag for deletes the server has not confirmed
//! - `remoteOriginal`, the last state known to equal the server's copy
//!
//! ### Changes
//!
//! Mutations travel as [`Change`] messages:
//! - [`CreateChange`] carries the full record
//! - [`UpdateChange`] carries a [`Delta`] computed by [`diff`]
//! - [`DeleteChange`] carries only the key and version
//!
//! ### Conflicts
//!
//! When a remote change hits a record modified locally, the store's
//! [`ConflictResolver`] receives the original, local and remote states and
//! chooses the outcome. Rejected pushes go to a [`RejectHandler`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_engine::{ChangeTracker, IndexDef, IndexQuery, MemoryStore, Schema, StoreDef};
//!
//! let schema = Schema::new(1)
//!     .with_store(StoreDef::new("roads").with_index(IndexDef::new("length")));
//! let tracker = ChangeTracker::new(Arc::new(MemoryStore::new(schema).unwrap()));
//!
//! let key = tracker.put_one("roads", json!({"length": 100})).unwrap();
//! assert_eq!(tracker.get_one("roads", &key).unwrap()["length"], 100);
//!
//! let short = tracker
//!     .query("roads", "length", &IndexQuery::all().lt(150))
//!     .unwrap();
//! assert_eq!(short.len(), 1);
//! assert_eq!(tracker.pending("roads").unwrap().len(), 1);
//! ```
//!
//! ## Persistence
//!
//! [`MemoryStore::export_snapshot`] and [`MemoryStore::import_snapshot`] move
//! a replica in and out of a [`StoreSnapshot`], serializable to JSON with
//! deterministic ordering.

pub mod change;
pub mod diff;
pub mod error;
pub mod events;
pub mod protocol;
pub mod record;
pub mod resolve;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod tracker;

// Re-export main types at crate root
pub use change::{Change, CreateChange, DeleteChange, UpdateChange};
pub use diff::{diff, patch, Delta};
pub use error::{Error, Result};
pub use events::{ChangeEvent, ChangeKind, Observers, SubscriptionId};
pub use protocol::{Ack, GetChanges, Message, Reject, SendingChanges};
pub use record::{Fields, Key, Origin, Record};
pub use resolve::{Conflict, ConflictResolver, RecordState, RejectHandler, Rejection, Resolution};
pub use schema::{IndexDef, Schema, StoreDef, CHANGED_INDEX, META_STORE};
pub use snapshot::{SnapshotEntry, SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{IndexQuery, IndexValue, LocalStore, MemoryStore, Transaction, TxMode};
pub use tracker::{Applied, ChangeSink, ChangeTracker, TrackedTransaction};

/// Type aliases for clarity
pub type StoreName = String;
pub type Version = u64;
/// Server-assigned position in a store's change log
pub type Timestamp = u64;
pub type SchemaVersion = u32;
