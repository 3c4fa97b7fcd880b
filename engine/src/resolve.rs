//! Conflict and reject hooks.
//!
//! The engine never merges concurrent edits on its own. When a remote change
//! targets a record that was modified locally, the store's [`ConflictResolver`]
//! decides the outcome. When the server refuses a change, a [`RejectHandler`]
//! decides whether to send a corrected record.

use crate::{Fields, Key, StoreName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordState {
    Present(Fields),
    Deleted,
}

impl RecordState {
    /// The fields, unless the record is deleted.
    pub fn fields(&self) -> Option<&Fields> {
        match self {
            RecordState::Present(fields) => Some(fields),
            RecordState::Deleted => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RecordState::Deleted)
    }
}

/// A remote change that collided with a local modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub store: StoreName,
    pub key: Key,
    /// Last state both sides agreed on
    pub original: Fields,
    /// Current local state
    pub local: RecordState,
    /// The original with the remote change applied
    pub remote: RecordState,
}

/// Outcome chosen by a resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Keep these fields locally and push them on the next sync
    Record(Fields),
    /// Delete the record
    Delete,
}

/// Decides how to settle a [`Conflict`].
///
/// Any `Fn(&Conflict) -> Resolution` closure is a resolver.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

/// A change the server refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub store: Option<StoreName>,
    pub key: Option<Key>,
    pub description: String,
    /// The local record as it is now, if it still exists
    pub record: Option<Value>,
}

/// Handles a [`Rejection`].
///
/// Returning a record stores it locally and sends it again. Returning `None`
/// drops the change from the running push; the record stays pending locally.
pub trait RejectHandler: Send + Sync {
    fn handle(&self, rejection: &Rejection) -> Option<Value>;
}

impl<F> RejectHandler for F
where
    F: Fn(&Rejection) -> Option<Value> + Send + Sync,
{
    fn handle(&self, rejection: &Rejection) -> Option<Value> {
        self(rejection)
    }
}
