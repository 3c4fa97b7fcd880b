//! Edge case tests for tether-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use std::sync::Arc;

use serde_json::{json, Value};
use tether_engine::{
    diff, patch, Ack, Applied, Change, ChangeTracker, Conflict, Delta, Error, Fields, IndexDef,
    IndexQuery, Key, MemoryStore, Message, Resolution, Schema, StoreDef, StoreSnapshot,
    UpdateChange,
};

fn create_test_schema() -> Schema {
    Schema::new(1).with_store(
        StoreDef::new("items")
            .with_index(IndexDef::new("name"))
            .with_index(IndexDef::named("city", "address.city")),
    )
}

fn tracker() -> ChangeTracker {
    ChangeTracker::new(Arc::new(MemoryStore::new(create_test_schema()).unwrap()))
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn ack(store: &str, key: Key, new_key: Key, new_version: u64, timestamp: u64) -> Ack {
    Ack {
        store_name: store.to_string(),
        key,
        new_key: Some(new_key),
        new_version,
        timestamp,
    }
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let tracker = tracker();
    let key = tracker.put_one("items", json!({"name": ""})).unwrap();
    assert_eq!(tracker.get_one("items", &key).unwrap()["name"], "");

    let found = tracker
        .query("items", "name", &IndexQuery::only(""))
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn unicode_strings() {
    let tracker = tracker();

    let unicode_names = vec![
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for (i, name) in unicode_names.iter().enumerate() {
        tracker
            .put_one("items", json!({"key": i as i64, "name": name}))
            .unwrap();
        let value = tracker.get_one("items", &Key::Int(i as i64)).unwrap();
        assert_eq!(value["name"], *name, "Failed for: {}", name);
    }

    let a = fields(json!({"name": unicode_names[0]}));
    let b = fields(json!({"name": unicode_names[3]}));
    let mut patched = a.clone();
    patch(&mut patched, &diff(&a, &b)).unwrap();
    assert_eq!(patched, b);
}

#[test]
fn very_long_strings() {
    let long = "x".repeat(1_000_000);
    let a = fields(json!({"body": ""}));
    let b = fields(json!({"body": long}));
    let delta = diff(&a, &b);
    assert_eq!(delta.modify["0"].as_str().map(str::len), Some(1_000_000));
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let tracker = tracker();
    for key in [i64::MIN, -1, 0, i64::MAX] {
        tracker
            .put_one("items", json!({"key": key, "n": key}))
            .unwrap();
    }
    let keys: Vec<Value> = tracker
        .all("items")
        .unwrap()
        .into_iter()
        .map(|v| v["key"].clone())
        .collect();
    assert_eq!(keys, vec![json!(i64::MIN), json!(-1), json!(0), json!(i64::MAX)]);
}

#[test]
fn fractional_keys_are_rejected() {
    let tracker = tracker();
    assert!(matches!(
        tracker.put_one("items", json!({"key": 1.5})),
        Err(Error::InvalidKey(_))
    ));
    assert!(matches!(
        tracker.put_one("items", json!({"key": true})),
        Err(Error::InvalidKey(_))
    ));
}

// ============================================================================
// Diff Edge Cases
// ============================================================================

#[test]
fn deeply_nested_json() {
    let mut a = json!({"leaf": 1});
    let mut b = json!({"leaf": 2});
    for _ in 0..50 {
        a = json!({"nested": a, "sibling": [1, 2, 3]});
        b = json!({"nested": b, "sibling": [1, 2, 3]});
    }
    let (a, b) = (fields(a), fields(b));
    let delta = diff(&a, &b);
    assert!(delta.modify.is_empty());
    assert_eq!(delta.recurse.len(), 1);

    let mut patched = a.clone();
    patch(&mut patched, &delta).unwrap();
    assert_eq!(patched, b);
}

#[test]
fn more_fields_than_digits() {
    // positions past 9 use tokens beyond the ASCII digits
    let a: Fields = (0..40).map(|i| (format!("f{:02}", i), json!(i))).collect();
    let mut b = a.clone();
    b.insert("f39".into(), json!("changed"));
    let delta = diff(&a, &b);
    assert_eq!(serde_json::to_value(&delta).unwrap(), json!({"m": {"W": "changed"}}));

    let mut patched = a.clone();
    patch(&mut patched, &delta).unwrap();
    assert_eq!(patched, b);
}

#[test]
fn array_indices_sort_as_strings() {
    let a = fields(json!({"xs": (0..12).collect::<Vec<_>>()}));
    let mut b = a.clone();
    b["xs"][10] = json!(100);
    let delta = diff(&a, &b);
    // "10" is the third name after "0" and "1"
    assert_eq!(
        serde_json::to_value(&delta).unwrap(),
        json!({"r": {"0": {"m": {"2": 100}}}})
    );
}

#[test]
fn field_with_special_characters_in_name() {
    let a = fields(json!({
        "with-dash": "a",
        "with_underscore": "b",
        "with.dot": "c",
        "with spaces": "d",
        "123numeric": "e"
    }));
    let mut b = a.clone();
    b.remove("with.dot");
    b.insert("key".into(), json!("not a key here"));
    let mut patched = a.clone();
    patch(&mut patched, &diff(&a, &b)).unwrap();
    assert_eq!(patched, b);
}

#[test]
fn delta_from_wrong_base_fails_or_diverges() {
    let a = fields(json!({"a": 1}));
    let b = fields(json!({"a": 2}));
    let delta = diff(&a, &b);

    let mut empty = Fields::new();
    assert!(matches!(patch(&mut empty, &delta), Err(Error::InvalidDelta(_))));

    let unknown: Result<Delta, _> = serde_json::from_value(json!({"m": 5}));
    assert!(unknown.is_err());
}

// ============================================================================
// Sync Scenarios
// ============================================================================

/// Two replicas edit the same road; the second to sync resolves the conflict.
#[test]
fn concurrent_edit_goes_through_resolver() {
    let first = tracker();
    let second = tracker();

    // Both replicas hold road 0 at version 0 with length 100
    let created: Change = serde_json::from_value(json!({
        "type": "create",
        "storeName": "items",
        "key": 0,
        "record": {"length": 100},
        "version": 0,
        "timestamp": 0
    }))
    .unwrap();
    assert_eq!(first.apply_remote(&created).unwrap(), Applied::Applied);
    assert_eq!(second.apply_remote(&created).unwrap(), Applied::Applied);

    first
        .put_one("items", json!({"key": 0, "length": 130}))
        .unwrap();
    second
        .put_one("items", json!({"key": 0, "length": 110}))
        .unwrap();

    // The first replica pushes and the server stamps the update
    let mut pushed = first
        .outbound_pending(&["items".to_string()])
        .unwrap()
        .remove(0);
    assert_eq!(pushed.kind(), "update");
    first
        .acknowledge(&ack("items", Key::Int(0), Key::Int(0), 1, 1))
        .unwrap();
    pushed.stamp(Key::Int(0), 1, 1);

    second
        .set_conflict_resolver(
            "items",
            Arc::new(|c: &Conflict| {
                let local = c.local.fields().and_then(|f| f["length"].as_i64()).unwrap_or(0);
                let remote = c.remote.fields().and_then(|f| f["length"].as_i64()).unwrap_or(0);
                let original = c.original["length"].as_i64().unwrap_or(0);
                let mut merged = c.original.clone();
                merged.insert("length".into(), json!(original + (local - original) + (remote - original)));
                Resolution::Record(merged)
            }),
        )
        .unwrap();
    assert_eq!(second.apply_remote(&pushed).unwrap(), Applied::Resolved);
    assert_eq!(second.get_one("items", &Key::Int(0)).unwrap()["length"], 140);

    // The resolved record goes back out as an update against version 1
    let resend = second
        .outbound_pending(&["items".to_string()])
        .unwrap()
        .remove(0);
    match resend {
        Change::Update(UpdateChange { version, diff, .. }) => {
            assert_eq!(version, 1);
            assert_eq!(serde_json::to_value(&diff).unwrap(), json!({"m": {"0": 140}}));
        }
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(first.get_one("items", &Key::Int(0)).unwrap()["length"], 130);
}

#[test]
fn many_pending_records() {
    let tracker = tracker();
    let values = (0..1000).map(|i| json!({"key": i, "name": format!("item_{}", i)}));
    tracker.put("items", values.collect()).unwrap();
    assert_eq!(tracker.pending("items").unwrap().len(), 1000);

    let changes = tracker.outbound_pending(&["items".to_string()]).unwrap();
    for (timestamp, change) in changes.iter().take(500).enumerate() {
        tracker
            .acknowledge(&ack(
                "items",
                change.key().clone(),
                change.key().clone(),
                0,
                timestamp as u64,
            ))
            .unwrap();
    }

    assert_eq!(tracker.pending("items").unwrap().len(), 500);
    assert_eq!(tracker.in_flight_count(), 500);
    assert_eq!(tracker.synced_to("items").unwrap(), Some(499));
}

#[test]
fn messages_roundtrip_through_text() {
    let text = r#"{"type":"get-changes","storeName":"items","since":4}"#;
    let message = Message::from_json(text).unwrap();
    assert_eq!(message.kind(), "get-changes");
    assert_eq!(message.store_name(), Some("items"));

    let custom = Message::from_json(r#"{"type":"ping","storeName":"items"}"#).unwrap();
    assert!(matches!(custom, Message::Custom(_)));
    assert!(matches!(
        Message::from_json(r#"{"storeName":"items"}"#),
        Err(Error::InvalidMessage(_))
    ));
}

// ============================================================================
// Index Edge Cases
// ============================================================================

#[test]
fn nested_key_path_index() {
    let tracker = tracker();
    tracker
        .put(
            "items",
            vec![
                json!({"key": 1, "address": {"city": "Oslo"}}),
                json!({"key": 2, "address": {"city": "Bergen"}}),
                json!({"key": 3, "address": "unknown"}),
            ],
        )
        .unwrap();

    let cities: Vec<Value> = tracker
        .query("items", "city", &IndexQuery::all())
        .unwrap()
        .into_iter()
        .map(|v| v["key"].clone())
        .collect();
    assert_eq!(cities, vec![json!(2), json!(1)]);

    let page = tracker
        .query("items", "city", &IndexQuery::all().reverse().limit(1))
        .unwrap();
    assert_eq!(page[0]["key"], 1);

    assert!(matches!(
        tracker.query("items", "missing", &IndexQuery::all()),
        Err(Error::IndexNotFound { .. })
    ));
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_store() {
    let store = MemoryStore::new(create_test_schema()).unwrap();
    let snapshot = store.export_snapshot();
    assert_eq!(snapshot.record_count(), 0);
    assert_eq!(snapshot.pending_count(), 0);

    let restored = MemoryStore::new(create_test_schema()).unwrap();
    assert!(restored.import_snapshot(snapshot).is_ok());
}

#[test]
fn snapshot_keeps_tombstones_and_cursor() {
    let store = Arc::new(MemoryStore::new(create_test_schema()).unwrap());
    let tracker = ChangeTracker::new(store.clone());

    for i in 0..10i64 {
        let created: Change = serde_json::from_value(json!({
            "type": "create",
            "storeName": "items",
            "key": i,
            "record": {"name": format!("item_{}", i)},
            "version": 0,
            "timestamp": i
        }))
        .unwrap();
        tracker.apply_remote(&created).unwrap();
        if i % 2 == 0 {
            tracker.delete("items", &[Key::Int(i)]).unwrap();
        }
    }

    let json = store.export_snapshot().to_json().unwrap();
    let snapshot = StoreSnapshot::from_json(&json).unwrap();
    assert_eq!(snapshot.record_count(), 10);
    assert_eq!(snapshot.pending_count(), 5);

    let restored = ChangeTracker::new(Arc::new(
        MemoryStore::from_snapshot(create_test_schema(), snapshot).unwrap(),
    ));
    assert_eq!(restored.all("items").unwrap().len(), 5);
    assert_eq!(restored.pending("items").unwrap().len(), 5);
    assert_eq!(restored.synced_to("items").unwrap(), Some(9));
    assert_eq!(restored.client_id().unwrap().len(), 36);
}

#[test]
fn snapshot_for_other_schema_is_rejected() {
    let store = MemoryStore::new(create_test_schema()).unwrap();
    let other = Schema::new(2).with_store(StoreDef::new("items"));
    assert!(matches!(
        MemoryStore::from_snapshot(other, store.export_snapshot()),
        Err(Error::InvalidSnapshot(_))
    ));
}

// ============================================================================
// Key Edge Cases
// ============================================================================

#[test]
fn keys_with_special_characters() {
    let tracker = tracker();

    let special_keys = vec![
        "simple",
        "with-dash",
        "with/slash",
        "with:colon",
        "uuid-style-550e8400-e29b-41d4-a716-446655440000",
        "emoji-🎉",
        "space test",
        "newline\ntest",
        "",
    ];

    for key in &special_keys {
        tracker
            .put_one("items", json!({"key": key, "name": "test"}))
            .unwrap();
        let value = tracker.get_one("items", &Key::from(*key));
        assert!(value.is_ok(), "Could not retrieve key: {:?}", key);
    }
    assert_eq!(tracker.all("items").unwrap().len(), special_keys.len());
}
