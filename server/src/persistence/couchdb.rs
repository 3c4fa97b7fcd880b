//! CouchDB change log.
//!
//! Each store has a metadata document holding its sequence state and the
//! latest version of every key. A change is accepted by updating that
//! document against its current `_rev`; a conflicting update from another
//! writer makes the save start over. The change itself is then written under
//! an id that sorts by timestamp, so a store's log is read back with one
//! `_all_docs` range query.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_engine::{Change, Timestamp};

use super::{stamp, ChangeLog, Cursor, KeyState};
use crate::error::{AppError, Result};

const MAX_ATTEMPTS: usize = 16;

/// Sequence state of one store as stored in CouchDB.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreMeta {
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    next_timestamp: Timestamp,
    next_key: i64,
    /// Latest state per key, by the key's JSON text
    #[serde(default)]
    keys: BTreeMap<String, KeyEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct KeyEntry {
    version: u64,
    #[serde(default)]
    deleted: bool,
}

/// Change log stored in a CouchDB database.
#[derive(Debug, Clone)]
pub struct CouchDbChangeLog {
    client: Client,
    db: Url,
}

impl CouchDbChangeLog {
    /// Open the database at `url`, creating it if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut db = Url::parse(url).map_err(|e| AppError::CouchDb(format!("invalid url: {}", e)))?;
        if !db.path().ends_with('/') {
            let path = format!("{}/", db.path());
            db.set_path(&path);
        }
        let log = Self {
            client: Client::new(),
            db,
        };
        log.create_db().await?;
        Ok(log)
    }

    async fn create_db(&self) -> Result<()> {
        let res = self.client.get(self.db.clone()).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            let res = self.client.put(self.db.clone()).send().await?;
            check(res.status(), "create database")?;
            tracing::info!(db = %self.db, "Created CouchDB database");
        } else {
            check(res.status(), "open database")?;
        }
        Ok(())
    }

    fn doc_url(&self, id: &str) -> Result<Url> {
        let mut url = self.db.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::CouchDb("database url cannot be a base".into()))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn load_meta(&self, store: &str) -> Result<StoreMeta> {
        let res = self.client.get(self.doc_url(&meta_doc_id(store))?).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(StoreMeta::default());
        }
        check(res.status(), "read store metadata")?;
        Ok(res.json().await?)
    }

    /// Write the metadata document. Returns false if another writer got there first.
    async fn store_meta(&self, store: &str, meta: &StoreMeta) -> Result<bool> {
        let res = self
            .client
            .put(self.doc_url(&meta_doc_id(store))?)
            .json(meta)
            .send()
            .await?;
        if res.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        check(res.status(), "update store metadata")?;
        Ok(true)
    }
}

#[async_trait]
impl ChangeLog for CouchDbChangeLog {
    async fn save_change(&self, change: Change) -> Result<Change> {
        let store = change.store_name().clone();
        let key = serde_json::to_string(change.key())?;

        for attempt in 0..MAX_ATTEMPTS {
            let mut meta = self.load_meta(&store).await?;
            let current = meta.keys.get(&key).map(|e| KeyState {
                version: e.version,
                deleted: e.deleted,
            });
            let mut cursor = Cursor {
                next_timestamp: meta.next_timestamp,
                next_key: meta.next_key,
            };
            let saved = stamp(change.clone(), current, &mut cursor)?;

            let state = KeyState::of(&saved);
            meta.next_timestamp = cursor.next_timestamp;
            meta.next_key = cursor.next_key;
            meta.keys.insert(
                serde_json::to_string(saved.key())?,
                KeyEntry {
                    version: state.version,
                    deleted: state.deleted,
                },
            );
            if !self.store_meta(&store, &meta).await? {
                tracing::debug!(store = %store, attempt, "Store metadata changed concurrently, retrying");
                continue;
            }

            let timestamp = saved.timestamp().unwrap_or(cursor.next_timestamp - 1);
            let res = self
                .client
                .put(self.doc_url(&change_doc_id(&store, timestamp))?)
                .json(&change_doc(&saved)?)
                .send()
                .await?;
            check(res.status(), "write change")?;
            return Ok(saved);
        }

        Err(AppError::CouchDb(format!(
            "gave up saving change to '{}' after {} conflicting attempts",
            store, MAX_ATTEMPTS
        )))
    }

    async fn get_changes(&self, store: &str, since: Option<Timestamp>) -> Result<Vec<Change>> {
        let first = since.map_or(0, |t| t + 1);
        let mut url = self.doc_url("_all_docs")?;
        url.query_pairs_mut()
            .append_pair("include_docs", "true")
            .append_pair("startkey", &Value::from(change_doc_id(store, first)).to_string())
            .append_pair("endkey", &Value::from(change_doc_prefix(store) + "\u{fff0}").to_string());

        let res = self.client.get(url).send().await?;
        check(res.status(), "read changes")?;
        let body: AllDocs = res.json().await?;
        body.rows
            .into_iter()
            .filter_map(|row| row.doc)
            .map(|doc| Ok(serde_json::from_value(strip_couch_fields(doc))?))
            .collect()
    }

    async fn reset_changes(&self) -> Result<()> {
        let res = self.client.delete(self.db.clone()).send().await?;
        if res.status() != StatusCode::NOT_FOUND {
            check(res.status(), "delete database")?;
        }
        self.create_db().await
    }
}

#[derive(Debug, Deserialize)]
struct AllDocs {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    doc: Option<Value>,
}

fn check(status: StatusCode, action: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(AppError::CouchDb(format!("{} failed with status {}", action, status)))
    }
}

fn meta_doc_id(store: &str) -> String {
    format!("store:{}", store)
}

fn change_doc_prefix(store: &str) -> String {
    format!("change:{}:", store)
}

/// Zero-padded so ids sort in timestamp order.
fn change_doc_id(store: &str, timestamp: Timestamp) -> String {
    format!("{}{:020}", change_doc_prefix(store), timestamp)
}

fn change_doc(change: &Change) -> Result<Value> {
    let mut doc = serde_json::to_value(change)?;
    if let Some(map) = doc.as_object_mut() {
        map.insert("docType".into(), json!("change"));
    }
    Ok(doc)
}

fn strip_couch_fields(mut doc: Value) -> Value {
    if let Some(map) = doc.as_object_mut() {
        map.remove("_id");
        map.remove("_rev");
        map.remove("docType");
    }
    doc
}
