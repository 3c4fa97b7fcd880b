//! Applying server messages to the local replica.

use super::{event, read_record, read_synced_to, write_record, write_synced_to, ChangeTracker};
use crate::{
    diff::patch,
    error::Result,
    events::{ChangeEvent, ChangeKind},
    protocol::{Ack, Reject},
    resolve::{Conflict, RecordState, Rejection, Resolution},
    schema::META_STORE,
    store::TxMode,
    Change, Error, Fields, Key, Origin, Record,
};
use serde_json::Value;
use tracing::{debug, warn};

/// What [`ChangeTracker::apply_remote`] did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Written to the local store
    Applied,
    /// Collided with a local modification and went through the resolver
    Resolved,
    /// Already reflected locally, or not applicable
    Skipped,
}

/// The writes decided for one remote change.
struct Step {
    /// An unacknowledged local record moved off the change's key
    relocate: Option<Record>,
    write: Option<Record>,
    remove: bool,
    event: Option<ChangeEvent>,
    /// Whether the written record must be pushed again
    push: bool,
    outcome: Applied,
}

impl Step {
    fn skip() -> Self {
        Self {
            relocate: None,
            write: None,
            remove: false,
            event: None,
            push: false,
            outcome: Applied::Skipped,
        }
    }

    fn write(record: Record, kind: ChangeKind, origin: Origin, store: &str) -> Self {
        let resolved = origin == Origin::Local;
        Self {
            relocate: None,
            event: Some(event(kind, store, &record, origin)),
            write: Some(record),
            remove: false,
            push: resolved,
            outcome: if resolved {
                Applied::Resolved
            } else {
                Applied::Applied
            },
        }
    }

    fn remove(prior: &Record, store: &str, outcome: Applied) -> Self {
        Self {
            relocate: None,
            write: None,
            remove: true,
            event: prior
                .is_active()
                .then(|| event(ChangeKind::Delete, store, prior, Origin::Remote)),
            push: false,
            outcome,
        }
    }
}

impl ChangeTracker {
    /// Apply a change received from the server.
    ///
    /// Changes at or below the store's sync cursor, and changes whose version
    /// the local record already has, are skipped. Changes to locally modified
    /// records go through the store's conflict resolver, which runs outside of
    /// any transaction; if the record changes meanwhile the change is retried.
    pub fn apply_remote(&self, change: &Change) -> Result<Applied> {
        let store = change.store_name().as_str();
        self.require_store(store)?;

        loop {
            let (synced_to, local) = {
                let tx = self
                    .store
                    .transaction(&[store, META_STORE], TxMode::ReadOnly)?;
                (
                    read_synced_to(tx.as_ref(), store)?,
                    read_record(tx.as_ref(), store, change.key())?,
                )
            };

            if let (Some(timestamp), Some(cursor)) = (change.timestamp(), synced_to) {
                if timestamp <= cursor {
                    debug!(store = %store, timestamp, "duplicate change skipped");
                    return Ok(Applied::Skipped);
                }
            }

            let step = self.plan(change, local.as_ref())?;

            let mut tx = self
                .store
                .transaction(&[store, META_STORE], TxMode::ReadWrite)?;
            if read_record(tx.as_ref(), store, change.key())? != local
                || read_synced_to(tx.as_ref(), store)? != synced_to
            {
                debug!(store = %store, key = %change.key(), "record changed during resolution, retrying");
                continue;
            }

            if let Some(moved) = &step.relocate {
                write_record(tx.as_mut(), store, moved)?;
            }
            if step.remove {
                tx.delete(store, change.key())?;
            }
            if let Some(record) = &step.write {
                if step.push {
                    self.mark_changed_since(store, &record.key);
                }
                write_record(tx.as_mut(), store, record)?;
            }
            if let Some(timestamp) = change.timestamp() {
                write_synced_to(tx.as_mut(), store, timestamp)?;
            }
            tx.commit()?;

            debug!(
                store = %store,
                key = %change.key(),
                kind = change.kind(),
                outcome = ?step.outcome,
                "remote change applied"
            );
            let mut events = Vec::with_capacity(2);
            if let Some(moved) = &step.relocate {
                self.move_in_flight(store, change.key(), &moved.key);
                events.push(event(ChangeKind::Add, store, moved, Origin::Internal));
            }
            events.extend(step.event);
            self.notify(events);
            if step.push {
                if let Some(record) = &step.write {
                    self.dispatch(store, std::slice::from_ref(record))?;
                }
            }
            return Ok(step.outcome);
        }
    }

    fn plan(&self, change: &Change, local: Option<&Record>) -> Result<Step> {
        let store = change.store_name().as_str();
        let key = change.key();

        let local = match (change, local) {
            (Change::Create(c), None) => {
                let record = Record::synced(key.clone(), c.version, c.record.clone());
                return Ok(Step::write(record, ChangeKind::Add, Origin::Remote, store));
            }
            (Change::Create(c), Some(local)) if local.version.is_none() => {
                // The server assigns the local record its own key when it is pushed.
                let mut moved = local.clone();
                moved.key = Key::generate();
                warn!(store = %store, key = %key, moved_to = %moved.key, "remote create collides with an unsynced local record, moving local record");
                let record = Record::synced(key.clone(), c.version, c.record.clone());
                let mut step = Step::write(record, ChangeKind::Add, Origin::Remote, store);
                step.relocate = Some(moved);
                return Ok(step);
            }
            (Change::Create(_), Some(_)) => return Ok(Step::skip()),
            (Change::Update(_), None) => {
                warn!(store = %store, key = %key, "update for unknown key skipped");
                return Ok(Step::skip());
            }
            (Change::Delete(_), None) => return Ok(Step::skip()),
            (_, Some(local)) => local,
        };

        match local.version {
            None => {
                warn!(store = %store, key = %key, "remote change for a record the server never acknowledged skipped");
                return Ok(Step::skip());
            }
            Some(version) if version >= change.version() => return Ok(Step::skip()),
            Some(_) => {}
        }

        match change {
            Change::Update(update) if !local.changed_since_sync => {
                let mut record = local.clone();
                patch(&mut record.fields, &update.diff)?;
                record.version = Some(update.version);
                Ok(Step::write(record, ChangeKind::Update, Origin::Remote, store))
            }
            Change::Update(update) => {
                let original = remote_original(local)?;
                let mut remote = original.clone();
                patch(&mut remote, &update.diff)?;

                let resolution = self.resolve(Conflict {
                    store: store.to_string(),
                    key: key.clone(),
                    original,
                    local: local_state(local),
                    remote: RecordState::Present(remote.clone()),
                })?;

                let mut record = Record {
                    key: key.clone(),
                    version: Some(update.version),
                    changed_since_sync: true,
                    deleted: false,
                    remote_original: Some(remote),
                    fields: Fields::new(),
                };
                let kind = match resolution {
                    Resolution::Record(fields) => {
                        record.fields = sanitize(fields)?;
                        if local.deleted {
                            ChangeKind::Add
                        } else {
                            ChangeKind::Update
                        }
                    }
                    Resolution::Delete => {
                        record.deleted = true;
                        ChangeKind::Delete
                    }
                };
                let mut step = Step::write(record, kind, Origin::Local, store);
                if kind == ChangeKind::Delete {
                    step.event = Some(event(kind, store, local, Origin::Local));
                }
                Ok(step)
            }
            Change::Delete(_) if local.deleted || !local.changed_since_sync => {
                Ok(Step::remove(local, store, Applied::Applied))
            }
            Change::Delete(_) => {
                let resolution = self.resolve(Conflict {
                    store: store.to_string(),
                    key: key.clone(),
                    original: remote_original(local)?,
                    local: local_state(local),
                    remote: RecordState::Deleted,
                })?;
                match resolution {
                    Resolution::Record(fields) => {
                        // The server copy is gone; push it again as a new record.
                        let record = Record::new(key.clone(), sanitize(fields)?);
                        Ok(Step::write(record, ChangeKind::Update, Origin::Local, store))
                    }
                    Resolution::Delete => Ok(Step::remove(local, store, Applied::Resolved)),
                }
            }
            Change::Create(_) => Ok(Step::skip()),
        }
    }

    fn resolve(&self, conflict: Conflict) -> Result<Resolution> {
        let resolver = self
            .hooks
            .read()
            .resolvers
            .get(&conflict.store)
            .cloned()
            .ok_or_else(|| Error::ConflictResolutionRequired {
                store: conflict.store.clone(),
                key: conflict.key.clone(),
            })?;
        debug!(store = %conflict.store, key = %conflict.key, "resolving conflict");
        Ok(resolver.resolve(&conflict))
    }

    /// Apply the server's acknowledgment of a pushed change.
    ///
    /// Returns the record if it must be pushed again: it was written locally
    /// after being sent, or deleted before its creation was acknowledged.
    pub fn acknowledge(&self, ack: &Ack) -> Result<Option<Record>> {
        let store = ack.store_name.as_str();
        self.require_store(store)?;
        let new_key = ack.new_key.clone().unwrap_or_else(|| ack.key.clone());
        let local_key = self.local_key(store, &ack.key);

        let mut tx = self
            .store
            .transaction(&[store, META_STORE], TxMode::ReadWrite)?;
        let sent = self
            .in_flight
            .lock()
            .remove(&(store.to_string(), local_key.clone()));
        if sent.is_none() {
            warn!(store = %store, key = %ack.key, "acknowledgment for a record that was not in flight");
        }

        let (stored, pending) = match (read_record(tx.as_ref(), store, &local_key)?, sent) {
            (Some(mut record), Some(sent)) if sent.changed_since => {
                if sent.record.deleted {
                    // Deleted on the server, recreated locally since.
                    record.version = None;
                    record.remote_original = None;
                } else {
                    record.version = Some(ack.new_version);
                    record.remote_original = Some(sent.record.fields);
                }
                record.changed_since_sync = true;
                record.key = new_key.clone();
                (Some(record.clone()), Some(record))
            }
            (Some(record), _) if record.deleted => (None, None),
            (Some(mut record), _) => {
                record.mark_synced(ack.new_version);
                record.key = new_key.clone();
                (Some(record), None)
            }
            (None, Some(sent)) if !sent.record.deleted => {
                // Deleted locally before the create was acknowledged.
                let tombstone = Record {
                    key: new_key.clone(),
                    version: Some(ack.new_version),
                    changed_since_sync: true,
                    deleted: true,
                    remote_original: Some(sent.record.fields),
                    fields: Fields::new(),
                };
                (Some(tombstone.clone()), Some(tombstone))
            }
            (None, _) => (None, None),
        };

        if stored.as_ref().map_or(true, |r| r.key != local_key) {
            tx.delete(store, &local_key)?;
        }
        if let Some(record) = &stored {
            write_record(tx.as_mut(), store, record)?;
        }
        let contiguous = match read_synced_to(tx.as_ref(), store)? {
            Some(cursor) => ack.timestamp == cursor + 1,
            None => ack.timestamp == 0,
        };
        if contiguous {
            write_synced_to(tx.as_mut(), store, ack.timestamp)?;
        }
        tx.commit()?;

        debug!(store = %store, key = %new_key, version = ack.new_version, "change acknowledged");
        self.notify(vec![ChangeEvent {
            kind: ChangeKind::Synced,
            store: store.to_string(),
            key: new_key,
            record: stored.filter(Record::is_active).map(|r| r.view()),
            origin: Origin::Internal,
        }]);
        Ok(pending)
    }

    /// Hand a rejected change to the reject handler.
    ///
    /// If the handler returns a record, it is stored and the change that sends
    /// it again is returned.
    pub fn reject(&self, reject: &Reject) -> Result<Option<Change>> {
        let handler = {
            let hooks = self.hooks.read();
            let handler = reject
                .store_name
                .as_ref()
                .and_then(|s| hooks.reject_handlers.get(s))
                .or(hooks.default_reject_handler.as_ref())
                .cloned();
            handler
        };
        let handler = handler.ok_or_else(|| {
            Error::RejectHandlerRequired(reject.store_name.clone().unwrap_or_default())
        })?;

        let (store, key) = match (&reject.store_name, &reject.key) {
            (Some(store), Some(key)) => (store.as_str(), key),
            _ => {
                handler.handle(&Rejection {
                    store: reject.store_name.clone(),
                    key: reject.key.clone(),
                    description: reject.description.clone(),
                    record: None,
                });
                return Ok(None);
            }
        };
        self.require_store(store)?;
        let local_key = self.local_key(store, key);
        let key = &local_key;
        self.in_flight
            .lock()
            .remove(&(store.to_string(), key.clone()));

        let current = {
            let tx = self.store.transaction(&[store], TxMode::ReadOnly)?;
            read_record(tx.as_ref(), store, key)?
        };
        warn!(store = %store, key = %key, description = %reject.description, "change rejected");
        let retry = handler.handle(&Rejection {
            store: Some(store.to_string()),
            key: Some(key.clone()),
            description: reject.description.clone(),
            record: current.filter(Record::is_active).map(|r| r.view()),
        });

        let mut value = match retry {
            Some(value) => value,
            None => return Ok(None),
        };
        if let Value::Object(map) = &mut value {
            map.entry("key").or_insert_with(|| key.to_value());
        }
        let record = match self.put_records(store, vec![value], false)?.pop() {
            Some(record) => record,
            None => return Ok(None),
        };
        self.outbound(store, &record)
    }
}

fn remote_original(local: &Record) -> Result<Fields> {
    local.remote_original.clone().ok_or_else(|| {
        Error::InvalidRecord(format!(
            "record {} is pending but has no remote original",
            local.key
        ))
    })
}

fn local_state(local: &Record) -> RecordState {
    if local.deleted {
        RecordState::Deleted
    } else {
        RecordState::Present(local.fields.clone())
    }
}

fn sanitize(fields: Fields) -> Result<Fields> {
    Record::parse_input(Value::Object(fields)).map(|(_, fields)| fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{CreateChange, DeleteChange, UpdateChange};
    use crate::schema::{Schema, StoreDef};
    use crate::{diff, Key, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn tracker() -> ChangeTracker {
        let schema = Schema::new(1).with_store(StoreDef::new("roads"));
        ChangeTracker::new(Arc::new(MemoryStore::new(schema).unwrap()))
    }

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn create(key: i64, timestamp: u64, record: Value) -> Change {
        Change::Create(CreateChange {
            store_name: "roads".into(),
            key: Key::Int(key),
            record: fields(record),
            version: 0,
            timestamp: Some(timestamp),
            client_id: None,
        })
    }

    fn update(key: i64, version: u64, timestamp: u64, from: Value, to: Value) -> Change {
        Change::Update(UpdateChange {
            store_name: "roads".into(),
            key: Key::Int(key),
            version,
            diff: diff(&fields(from), &fields(to)),
            timestamp: Some(timestamp),
            client_id: None,
        })
    }

    fn delete(key: i64, version: u64, timestamp: u64) -> Change {
        Change::Delete(DeleteChange {
            store_name: "roads".into(),
            key: Key::Int(key),
            version,
            timestamp: Some(timestamp),
            client_id: None,
        })
    }

    fn stored(tracker: &ChangeTracker, key: Key) -> Record {
        tracker
            .get_including_deleted("roads", &[key])
            .unwrap()
            .remove(0)
    }

    #[test]
    fn create_then_update_unmodified() {
        let tracker = tracker();
        assert_eq!(
            tracker.apply_remote(&create(0, 0, json!({"length": 100}))).unwrap(),
            Applied::Applied
        );
        assert_eq!(
            tracker
                .apply_remote(&update(0, 1, 1, json!({"length": 100}), json!({"length": 130})))
                .unwrap(),
            Applied::Applied
        );

        let record = stored(&tracker, Key::Int(0));
        assert_eq!(record.fields["length"], 130);
        assert_eq!(record.version, Some(1));
        assert!(!record.changed_since_sync);
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(1));
    }

    #[test]
    fn duplicates_and_old_versions_are_skipped() {
        let tracker = tracker();
        tracker.apply_remote(&create(0, 0, json!({"a": 1}))).unwrap();
        assert_eq!(
            tracker.apply_remote(&create(0, 0, json!({"a": 1}))).unwrap(),
            Applied::Skipped
        );

        // A newer timestamp carrying a version already present locally
        let mut own = update(0, 0, 5, json!({"a": 1}), json!({"a": 2}));
        if let Change::Update(u) = &mut own {
            u.version = 0;
        }
        assert_eq!(tracker.apply_remote(&own).unwrap(), Applied::Skipped);
        assert_eq!(stored(&tracker, Key::Int(0)).fields["a"], 1);
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(5));
    }

    #[test]
    fn update_for_unknown_key_is_skipped() {
        let tracker = tracker();
        assert_eq!(
            tracker
                .apply_remote(&update(9, 1, 0, json!({"a": 1}), json!({"a": 2})))
                .unwrap(),
            Applied::Skipped
        );
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(0));
    }

    #[test]
    fn conflicting_update_calls_resolver() {
        let tracker = tracker();
        tracker
            .apply_remote(&create(0, 0, json!({"length": 100})))
            .unwrap();
        tracker
            .put_one("roads", json!({"key": 0, "length": 110}))
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let captured = seen.clone();
        tracker
            .set_conflict_resolver(
                "roads",
                Arc::new(move |c: &Conflict| {
                    *captured.lock() = Some(c.clone());
                    Resolution::Record(fields(json!({"length": 120})))
                }),
            )
            .unwrap();

        let outcome = tracker
            .apply_remote(&update(0, 1, 1, json!({"length": 100}), json!({"length": 130})))
            .unwrap();
        assert_eq!(outcome, Applied::Resolved);

        let conflict = seen.lock().clone().unwrap();
        assert_eq!(conflict.original["length"], 100);
        assert_eq!(conflict.local.fields().unwrap()["length"], 110);
        assert_eq!(conflict.remote.fields().unwrap()["length"], 130);

        let record = stored(&tracker, Key::Int(0));
        assert_eq!(record.fields["length"], 120);
        assert_eq!(record.version, Some(1));
        assert!(record.changed_since_sync);
        assert_eq!(record.remote_original.unwrap()["length"], 130);
    }

    #[test]
    fn conflict_without_resolver_fails() {
        let tracker = tracker();
        tracker.apply_remote(&create(0, 0, json!({"a": 1}))).unwrap();
        tracker.put_one("roads", json!({"key": 0, "a": 2})).unwrap();
        assert!(matches!(
            tracker.apply_remote(&delete(0, 1, 1)),
            Err(Error::ConflictResolutionRequired { .. })
        ));
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(0));
    }

    #[test]
    fn remote_delete() {
        let tracker = tracker();
        tracker.apply_remote(&create(0, 0, json!({"a": 1}))).unwrap();
        tracker.apply_remote(&delete(0, 1, 1)).unwrap();
        assert!(tracker.get_including_deleted("roads", &[Key::Int(0)]).is_err());
    }

    #[test]
    fn remote_delete_resolved_as_record_becomes_create() {
        let tracker = tracker();
        tracker.apply_remote(&create(0, 0, json!({"a": 1}))).unwrap();
        tracker.put_one("roads", json!({"key": 0, "a": 2})).unwrap();
        tracker
            .set_conflict_resolver(
                "roads",
                Arc::new(|c: &Conflict| Resolution::Record(c.local.fields().cloned().unwrap_or_default())),
            )
            .unwrap();

        tracker.apply_remote(&delete(0, 1, 1)).unwrap();
        let record = stored(&tracker, Key::Int(0));
        assert_eq!(record.version, None);
        assert!(record.remote_original.is_none());
        assert!(record.changed_since_sync);

        let change = tracker.outbound("roads", &record).unwrap().unwrap();
        assert_eq!(change.kind(), "create");
    }

    #[test]
    fn acknowledge_create_rekeys() {
        let tracker = tracker();
        let local_key = tracker.put_one("roads", json!({"length": 100})).unwrap();
        let changes = tracker.outbound_pending(&["roads".to_string()]).unwrap();
        assert_eq!(changes.len(), 1);

        let pending = tracker
            .acknowledge(&Ack {
                store_name: "roads".into(),
                key: local_key.clone(),
                new_key: Some(Key::Int(0)),
                new_version: 0,
                timestamp: 0,
            })
            .unwrap();
        assert!(pending.is_none());

        assert!(tracker.get("roads", &[local_key]).is_err());
        let record = stored(&tracker, Key::Int(0));
        assert!(!record.changed_since_sync);
        assert!(record.remote_original.is_none());
        assert_eq!(record.version, Some(0));
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(0));
        assert_eq!(tracker.in_flight_count(), 0);
    }

    fn pending_keys(tracker: &ChangeTracker) -> Vec<Key> {
        tracker
            .pending("roads")
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect()
    }

    #[test]
    fn remote_create_moves_unsynced_local_record() {
        let tracker = tracker();
        tracker
            .put_one("roads", json!({"key": 0, "name": "mine"}))
            .unwrap();

        assert_eq!(
            tracker.apply_remote(&create(0, 0, json!({"name": "theirs"}))).unwrap(),
            Applied::Applied
        );
        let theirs = stored(&tracker, Key::Int(0));
        assert_eq!(theirs.fields["name"], "theirs");
        assert!(!theirs.changed_since_sync);

        let moved = pending_keys(&tracker);
        assert_eq!(moved.len(), 1);
        assert_ne!(moved[0], Key::Int(0));

        // pushed later, the local record gets its own server key
        tracker.outbound_pending(&["roads".to_string()]).unwrap();
        tracker
            .acknowledge(&Ack {
                store_name: "roads".into(),
                key: moved[0].clone(),
                new_key: Some(Key::Int(1)),
                new_version: 0,
                timestamp: 1,
            })
            .unwrap();
        let mut names: Vec<Value> = tracker
            .all("roads")
            .unwrap()
            .into_iter()
            .map(|r| r["name"].clone())
            .collect();
        names.sort_by_key(|v| v.to_string());
        assert_eq!(names, vec![json!("mine"), json!("theirs")]);
        assert_eq!(stored(&tracker, Key::Int(1)).fields["name"], "mine");
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(1));
    }

    #[test]
    fn acknowledgment_follows_a_moved_record() {
        let tracker = tracker();
        tracker
            .put_one("roads", json!({"key": 0, "name": "mine"}))
            .unwrap();
        // sent under key 0 before the other client's create arrives
        assert_eq!(tracker.outbound_pending(&["roads".to_string()]).unwrap().len(), 1);
        tracker
            .apply_remote(&create(0, 0, json!({"name": "theirs"})))
            .unwrap();
        assert_eq!(tracker.in_flight_count(), 1);

        let pending = tracker
            .acknowledge(&Ack {
                store_name: "roads".into(),
                key: Key::Int(0),
                new_key: Some(Key::Int(1)),
                new_version: 0,
                timestamp: 1,
            })
            .unwrap();
        assert!(pending.is_none());
        assert_eq!(tracker.in_flight_count(), 0);
        assert_eq!(stored(&tracker, Key::Int(0)).fields["name"], "theirs");
        let mine = stored(&tracker, Key::Int(1));
        assert_eq!(mine.fields["name"], "mine");
        assert!(!mine.changed_since_sync);
        assert!(pending_keys(&tracker).is_empty());
        assert_eq!(tracker.all("roads").unwrap().len(), 2);
    }

    #[test]
    fn acknowledge_after_local_change_keeps_record_pending() {
        let tracker = tracker();
        let key = tracker.put_one("roads", json!({"length": 100})).unwrap();
        tracker.outbound_pending(&["roads".to_string()]).unwrap();
        tracker
            .put_one("roads", json!({"key": key.to_value(), "length": 110}))
            .unwrap();

        let pending = tracker
            .acknowledge(&Ack {
                store_name: "roads".into(),
                key,
                new_key: Some(Key::Int(3)),
                new_version: 0,
                timestamp: 7,
            })
            .unwrap()
            .unwrap();
        assert_eq!(pending.key, Key::Int(3));

        let record = stored(&tracker, Key::Int(3));
        assert!(record.changed_since_sync);
        assert_eq!(record.version, Some(0));
        assert_eq!(record.remote_original.unwrap()["length"], 100);
        assert_eq!(record.fields["length"], 110);
        // not contiguous with an empty cursor
        assert_eq!(tracker.synced_to("roads").unwrap(), None);
    }

    #[test]
    fn acknowledge_after_local_delete_leaves_tombstone() {
        let tracker = tracker();
        let key = tracker.put_one("roads", json!({"length": 100})).unwrap();
        tracker.outbound_pending(&["roads".to_string()]).unwrap();
        tracker.delete("roads", &[key.clone()]).unwrap();

        let pending = tracker
            .acknowledge(&Ack {
                store_name: "roads".into(),
                key,
                new_key: Some(Key::Int(0)),
                new_version: 0,
                timestamp: 0,
            })
            .unwrap()
            .unwrap();
        assert!(pending.deleted);
        let change = Change::from_record("roads", &pending, None).unwrap();
        assert_eq!(change.kind(), "delete");
        assert_eq!(change.key(), &Key::Int(0));
    }

    #[test]
    fn acknowledged_delete_purges_tombstone() {
        let tracker = tracker();
        tracker.apply_remote(&create(0, 0, json!({"a": 1}))).unwrap();
        tracker.delete("roads", &[Key::Int(0)]).unwrap();
        tracker.outbound_pending(&["roads".to_string()]).unwrap();

        tracker
            .acknowledge(&Ack {
                store_name: "roads".into(),
                key: Key::Int(0),
                new_key: None,
                new_version: 1,
                timestamp: 1,
            })
            .unwrap();
        assert!(tracker.get_including_deleted("roads", &[Key::Int(0)]).is_err());
        assert_eq!(tracker.synced_to("roads").unwrap(), Some(1));
    }

    #[test]
    fn reject_routes_to_handler() {
        let tracker = tracker();
        let key = tracker.put_one("roads", json!({"length": -1})).unwrap();
        tracker.outbound_pending(&["roads".to_string()]).unwrap();

        let rejection = Reject {
            store_name: Some("roads".into()),
            key: Some(key.clone()),
            description: "negative length".into(),
        };
        assert!(matches!(
            tracker.reject(&rejection),
            Err(Error::RejectHandlerRequired(_))
        ));

        tracker
            .set_reject_handler(
                Some("roads"),
                Arc::new(|r: &Rejection| {
                    let mut record = r.record.clone()?;
                    record["length"] = json!(0);
                    Some(record)
                }),
            )
            .unwrap();
        let resend = tracker.reject(&rejection).unwrap().unwrap();
        match resend {
            Change::Create(c) => assert_eq!(c.record["length"], 0),
            other => panic!("expected create, got {:?}", other),
        }
        assert_eq!(tracker.get_one("roads", &key).unwrap()["length"], 0);

        tracker
            .set_reject_handler(None, Arc::new(|_: &Rejection| None))
            .unwrap();
        let anonymous = Reject {
            store_name: None,
            key: None,
            description: "unauthorized".into(),
        };
        assert_eq!(tracker.reject(&anonymous).unwrap(), None);
    }
}
