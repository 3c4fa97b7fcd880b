//! Sync sessions against an in-process server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tether_client::{Channel, Connector, Database, Error, Result, SyncState};
use tether_engine::{
    ChangeEvent, Conflict, Fields, IndexDef, Key, Message, RecordState, Rejection, Resolution,
    Schema, SendingChanges, StoreDef,
};
use tether_server::{AppError, Context, HandlerTable, MemoryChangeLog, SyncServer};
use tokio::sync::Notify;

fn schema() -> Schema {
    Schema::new(1)
        .with_store(StoreDef::new("roads").with_index(IndexDef::new("length")))
        .with_store(StoreDef::new("cars"))
}

fn server() -> Arc<SyncServer> {
    Arc::new(SyncServer::new(Arc::new(MemoryChangeLog::new())))
}

fn local(server: &Arc<SyncServer>) -> impl Connector {
    let server = server.clone();
    move || {
        let (tx, rx) = server.connect_local();
        Channel { tx, rx }
    }
}

fn open(server: &Arc<SyncServer>) -> Database {
    Database::open(schema(), local(server)).unwrap()
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Connects only once the gate is opened.
struct Gated {
    server: Arc<SyncServer>,
    gate: Arc<Notify>,
}

#[async_trait]
impl Connector for Gated {
    async fn connect(&self) -> Result<Channel> {
        self.gate.notified().await;
        let (tx, rx) = self.server.connect_local();
        Ok(Channel { tx, rx })
    }
}

#[tokio::test]
async fn test_created_record_reaches_second_client() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    let key = a.store("roads").unwrap().put_one(json!({"length": 100})).unwrap();
    a.push(&["roads"]).await.unwrap();

    b.pull(&["roads"]).await.unwrap();
    let roads = b.store("roads").unwrap().all().unwrap();
    assert_eq!(roads.len(), 1);
    assert_eq!(roads[0]["length"], 100);
    assert_eq!(roads[0]["key"], 0);

    // the server assigned the canonical key
    assert!(matches!(
        a.store("roads").unwrap().get(&[key]),
        Err(Error::Engine(tether_engine::Error::KeyNotFound { .. }))
    ));
    let record = &a
        .tracker()
        .get_including_deleted("roads", &[Key::Int(0)])
        .unwrap()[0];
    assert!(!record.changed_since_sync);
    assert!(record.remote_original.is_none());
    assert_eq!(record.version, Some(0));
    assert_eq!(a.tracker().synced_to("roads").unwrap(), Some(0));
}

#[tokio::test]
async fn test_pull_counts_every_change() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    let values = (0..50).map(|i| json!({"length": i})).collect();
    a.store("roads").unwrap().put(values).unwrap();
    a.store("cars").unwrap().put_one(json!({"model": "T"})).unwrap();
    a.sync(&[]).await.unwrap();
    assert!(a.tracker().pending("roads").unwrap().is_empty());

    b.pull(&[]).await.unwrap();
    assert_eq!(b.store("roads").unwrap().all().unwrap().len(), 50);
    assert_eq!(b.store("cars").unwrap().all().unwrap().len(), 1);
    assert_eq!(b.tracker().synced_to("roads").unwrap(), Some(49));

    // nothing new the second time
    b.pull(&["roads"]).await.unwrap();
    assert_eq!(b.store("roads").unwrap().all().unwrap().len(), 50);
}

#[tokio::test]
async fn test_pull_announces_incoming_changes() {
    let server = server();
    let a = open(&server);
    let b = open(&server);
    a.store("roads").unwrap().put_one(json!({"length": 1})).unwrap();
    a.push(&["roads"]).await.unwrap();

    let headers = Arc::new(Mutex::new(Vec::new()));
    let seen = headers.clone();
    b.sync_initiated().subscribe(move |header: &SendingChanges| {
        seen.lock().push(header.nr_of_records_to_sync);
    });
    b.pull(&["roads", "cars"]).await.unwrap();

    let mut counts = headers.lock().clone();
    counts.sort();
    assert_eq!(counts, vec![0, 1]);
}

#[tokio::test]
async fn test_write_spans_stores_and_syncs() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    a.events().subscribe(move |e: &ChangeEvent| seen.lock().push(e.store.clone()));

    a.write(&["roads", "cars"], |tx| {
        let road = tx.put_one("roads", json!({"length": 3}))?;
        tx.put_one("cars", json!({"road": road.to_value()}))?;
        Ok(())
    })
    .unwrap();
    assert_eq!(*events.lock(), vec!["roads".to_string(), "cars".to_string()]);

    // a failing write changes nothing
    let result = a.write(&["roads", "cars"], |tx| {
        tx.put_one("roads", json!({"length": 4}))?;
        tx.delete("cars", &[Key::Str("missing".into())])
    });
    assert!(matches!(
        result,
        Err(Error::Engine(tether_engine::Error::KeyNotFound { .. }))
    ));
    assert_eq!(events.lock().len(), 2);

    a.push(&[]).await.unwrap();
    b.pull(&[]).await.unwrap();
    let (roads, cars) = b
        .read(&["roads", "cars"], |tx| Ok((tx.all("roads")?, tx.all("cars")?)))
        .unwrap();
    assert_eq!(roads.len(), 1);
    assert_eq!(roads[0]["length"], 3);
    assert_eq!(cars.len(), 1);
}

#[tokio::test]
async fn test_second_session_fails_while_syncing() {
    let server = server();
    let gate = Arc::new(Notify::new());
    let db = Database::open(
        schema(),
        Gated {
            server: server.clone(),
            gate: gate.clone(),
        },
    )
    .unwrap();
    db.store("roads").unwrap().put_one(json!({"length": 1})).unwrap();

    let first = tokio::spawn({
        let db = db.clone();
        async move { db.sync(&[]).await }
    });
    eventually(|| db.is_syncing()).await;
    assert_eq!(db.sync_state(), SyncState::Connecting);

    assert_eq!(db.pull(&[]).await, Err(Error::AlreadySyncing));
    assert!(matches!(
        db.sync_continuously(&[]).await,
        Err(Error::AlreadySyncing)
    ));

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(db.sync_state(), SyncState::Idle);
    assert!(db.tracker().pending("roads").unwrap().is_empty());

    // the guard is released once the session ends
    gate.notify_one();
    db.push(&[]).await.unwrap();
}

#[tokio::test]
async fn test_conflicting_update_goes_through_resolver() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    a.store("roads").unwrap().put_one(json!({"length": 100})).unwrap();
    a.sync(&["roads"]).await.unwrap();
    b.sync(&["roads"]).await.unwrap();

    // both edit the same record
    b.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 110}))
        .unwrap();
    a.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 130}))
        .unwrap();
    a.push(&["roads"]).await.unwrap();

    let seen: Arc<Mutex<Vec<Conflict>>> = Arc::default();
    b.store("roads")
        .unwrap()
        .on_conflict({
            let seen = seen.clone();
            move |conflict: &Conflict| {
                seen.lock().push(conflict.clone());
                Resolution::Record(fields(json!({"length": 120})))
            }
        })
        .unwrap();
    b.sync(&["roads"]).await.unwrap();

    let conflicts = seen.lock().clone();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].key, Key::Int(0));
    assert_eq!(conflicts[0].original["length"], 100);
    assert_eq!(
        conflicts[0].local,
        RecordState::Present(fields(json!({"length": 110})))
    );
    assert_eq!(
        conflicts[0].remote,
        RecordState::Present(fields(json!({"length": 130})))
    );

    // the resolution was pushed on top of the remote version
    a.pull(&["roads"]).await.unwrap();
    assert_eq!(
        a.store("roads").unwrap().get_one(&Key::Int(0)).unwrap()["length"],
        120
    );
    let record = &b
        .tracker()
        .get_including_deleted("roads", &[Key::Int(0)])
        .unwrap()[0];
    assert_eq!(record.version, Some(2));
    assert!(!record.changed_since_sync);
}

#[tokio::test]
async fn test_missing_resolver_fails_pull() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    a.store("roads").unwrap().put_one(json!({"length": 100})).unwrap();
    a.sync(&[]).await.unwrap();
    b.sync(&[]).await.unwrap();

    b.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 110}))
        .unwrap();
    a.store("roads").unwrap().delete(&[Key::Int(0)]).unwrap();
    a.push(&[]).await.unwrap();

    assert!(matches!(
        b.pull(&["roads"]).await,
        Err(Error::Engine(
            tether_engine::Error::ConflictResolutionRequired { .. }
        ))
    ));
    assert!(!b.is_syncing());
}

#[tokio::test]
async fn test_panicking_resolver_ends_session() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    a.store("roads").unwrap().put_one(json!({"length": 100})).unwrap();
    a.sync(&[]).await.unwrap();
    b.sync(&[]).await.unwrap();

    b.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 110}))
        .unwrap();
    a.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 130}))
        .unwrap();
    a.push(&[]).await.unwrap();

    b.store("roads")
        .unwrap()
        .on_conflict(|_: &Conflict| -> Resolution { panic!("resolver exploded") })
        .unwrap();
    match b.pull(&["roads"]).await {
        Err(Error::Panicked(reason)) => assert!(reason.contains("resolver exploded")),
        other => panic!("expected a panic error, got {:?}", other),
    }
    assert!(!b.is_syncing());
    assert!(!b.is_connected());

    // the local edit survived and the next session starts normally
    assert_eq!(
        b.store("roads").unwrap().get_one(&Key::Int(0)).unwrap()["length"],
        110
    );
    assert!(matches!(
        b.push(&[]).await,
        Err(Error::Engine(tether_engine::Error::RejectHandlerRequired(_)))
    ));
}

#[tokio::test]
async fn test_remote_delete_is_applied() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    a.store("roads").unwrap().put_one(json!({"length": 100})).unwrap();
    a.sync(&[]).await.unwrap();
    b.sync(&[]).await.unwrap();
    assert_eq!(b.store("roads").unwrap().all().unwrap().len(), 1);

    a.store("roads").unwrap().delete(&[Key::Int(0)]).unwrap();
    a.push(&[]).await.unwrap();
    // the acknowledged tombstone is gone
    assert!(a
        .tracker()
        .get_including_deleted("roads", &[Key::Int(0)])
        .is_err());

    b.pull(&[]).await.unwrap();
    assert!(b.store("roads").unwrap().all().unwrap().is_empty());
}

#[tokio::test]
async fn test_reject_goes_to_handler() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    a.store("roads").unwrap().put_one(json!({"length": 100})).unwrap();
    a.sync(&[]).await.unwrap();
    b.sync(&[]).await.unwrap();

    a.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 130}))
        .unwrap();
    a.push(&[]).await.unwrap();

    // b pushes against the old version without pulling first
    b.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 110}))
        .unwrap();
    assert!(matches!(
        b.push(&[]).await,
        Err(Error::Engine(tether_engine::Error::RejectHandlerRequired(_)))
    ));

    let rejected: Arc<Mutex<Vec<Rejection>>> = Arc::default();
    b.on_reject({
        let rejected = rejected.clone();
        move |rejection: &Rejection| {
            rejected.lock().push(rejection.clone());
            None
        }
    })
    .unwrap();
    b.push(&[]).await.unwrap();

    let rejected = rejected.lock().clone();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].key, Some(Key::Int(0)));
    assert!(rejected[0].description.contains("version"));
    assert_eq!(rejected[0].record.as_ref().unwrap()["length"], 110);
    // still pending for a later push
    assert_eq!(b.tracker().pending("roads").unwrap().len(), 1);
}

#[tokio::test]
async fn test_continuous_sync_forwards_both_ways() {
    let server = server();
    let a = open(&server);
    let b = open(&server);

    let live_a = a.sync_continuously(&["roads"]).await.unwrap();
    let live_b = b.sync_continuously(&["roads"]).await.unwrap();
    assert_eq!(a.sync_state(), SyncState::Continuous);

    a.store("roads").unwrap().put_one(json!({"length": 5})).unwrap();
    live_a.flush().await.unwrap();
    eventually(|| b.store("roads").unwrap().all().unwrap().len() == 1).await;

    b.store("roads")
        .unwrap()
        .put_one(json!({"key": 0, "length": 6}))
        .unwrap();
    live_b.flush().await.unwrap();
    eventually(|| {
        a.store("roads")
            .unwrap()
            .get_one(&Key::Int(0))
            .is_ok_and(|r| r["length"] == 6)
    })
    .await;

    live_a.stop().unwrap();
    live_b.stop().unwrap();
    assert!(!a.is_syncing());
    assert!(!a.is_connected());

    // stopped: local writes stay pending
    a.store("roads").unwrap().put_one(json!({"length": 7})).unwrap();
    assert_eq!(a.tracker().pending("roads").unwrap().len(), 1);
}

#[tokio::test]
async fn test_custom_messages_reach_observers() {
    let mut handlers = HandlerTable::defaults();
    handlers.set("hello", |ctx: Context, _message: Message| async move {
        ctx.respond(Message::Custom(json!({"type": "welcome", "storeName": "roads"})));
        ctx.respond(Message::Custom(json!({"type": "welcome"})));
        Ok::<_, AppError>(())
    });
    let server = Arc::new(
        SyncServer::new(Arc::new(MemoryChangeLog::new())).with_handlers(handlers),
    );
    let db = open(&server);

    let for_roads: Arc<Mutex<Vec<Value>>> = Arc::default();
    let for_db: Arc<Mutex<Vec<Value>>> = Arc::default();
    db.store("roads").unwrap().messages().unwrap().subscribe({
        let seen = for_roads.clone();
        move |m: &Value| seen.lock().push(m.clone())
    });
    db.messages().subscribe({
        let seen = for_db.clone();
        move |m: &Value| seen.lock().push(m.clone())
    });

    assert_eq!(
        db.send(Message::Custom(json!({"type": "hello"}))),
        Err(Error::Disconnected)
    );
    db.connect().await.unwrap();
    db.send(Message::Custom(json!({"type": "hello"}))).unwrap();

    eventually(|| for_roads.lock().len() == 1 && for_db.lock().len() == 1).await;
    assert_eq!(for_roads.lock()[0]["storeName"], "roads");
    assert!(for_db.lock()[0].get("storeName").is_none());

    // an explicit connection survives sessions
    db.sync(&[]).await.unwrap();
    assert!(db.is_connected());
    db.disconnect();
    assert!(!db.is_connected());
}

#[tokio::test]
async fn test_lost_connection_fails_session() {
    let db = Database::open(schema(), || {
        let (tx, server_rx) = tokio::sync::mpsc::unbounded_channel();
        let (server_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(server_rx);
        drop(server_tx);
        Channel { tx, rx }
    })
    .unwrap();

    db.store("roads").unwrap().put_one(json!({"length": 1})).unwrap();
    assert_eq!(db.push(&[]).await, Err(Error::Disconnected));
    assert!(!db.is_syncing());
    // nothing was lost
    assert_eq!(db.tracker().pending("roads").unwrap().len(), 1);
}
