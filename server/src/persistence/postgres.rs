//! PostgreSQL change log.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tether_engine::{Change, Timestamp};

use super::{stamp, ChangeLog, Cursor, KeyState};
use crate::error::{AppError, Result};

/// Change log stored in the `tether_changes` table.
///
/// The store's row in `tether_stores` is locked for the duration of the
/// insert transaction, which serializes writers per store.
#[derive(Debug, Clone)]
pub struct PostgresChangeLog {
    pool: PgPool,
}

impl PostgresChangeLog {
    /// Connect and run the migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Use an existing pool whose schema is already migrated.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeLog for PostgresChangeLog {
    async fn save_change(&self, change: Change) -> Result<Change> {
        let store = change.store_name().clone();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tether_stores (store_name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(&store)
            .execute(&mut *tx)
            .await?;
        let (next_timestamp, next_key): (i64, i64) = sqlx::query_as(
            "SELECT next_timestamp, next_key FROM tether_stores WHERE store_name = $1 FOR UPDATE",
        )
        .bind(&store)
        .fetch_one(&mut *tx)
        .await?;

        let current = match &change {
            Change::Create(_) => None,
            _ => sqlx::query_as::<_, (i64, String)>(
                r#"
                SELECT version, kind FROM tether_changes
                WHERE store_name = $1 AND key = $2
                ORDER BY timestamp DESC
                LIMIT 1
                "#,
            )
            .bind(&store)
            .bind(change.key().to_value())
            .fetch_optional(&mut *tx)
            .await?
            .map(|(version, kind)| key_state(version, &kind)),
        };

        let mut cursor = Cursor {
            next_timestamp: next_timestamp as Timestamp,
            next_key,
        };
        let saved = stamp(change, current, &mut cursor)?;

        sqlx::query(
            r#"
            INSERT INTO tether_changes (store_name, timestamp, key, version, kind, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&store)
        .bind(next_timestamp)
        .bind(saved.key().to_value())
        .bind(saved.version() as i64)
        .bind(saved.kind())
        .bind(serde_json::to_value(&saved)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tether_stores SET next_timestamp = $2, next_key = $3 WHERE store_name = $1",
        )
        .bind(&store)
        .bind(cursor.next_timestamp as i64)
        .bind(cursor.next_key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(saved)
    }

    async fn get_changes(&self, store: &str, since: Option<Timestamp>) -> Result<Vec<Change>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT data FROM tether_changes
            WHERE store_name = $1 AND timestamp > $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(store)
        .bind(since_bound(since))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(data,)| serde_json::from_value(data).map_err(AppError::from))
            .collect()
    }

    async fn reset_changes(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tether_changes")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tether_stores")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Lower timestamp bound for a `since` query; no cursor means from the start.
fn since_bound(since: Option<Timestamp>) -> i64 {
    since.map_or(-1, |t| i64::try_from(t).unwrap_or(i64::MAX))
}

fn key_state(version: i64, kind: &str) -> KeyState {
    KeyState {
        version: version as u64,
        deleted: kind == "delete",
    }
}
