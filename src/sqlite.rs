//! SQLite storage backend.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - One row per `(area, key)`, value stored as JSON text
//! - Session area wiped whenever the database is opened
//! - Change notifications via in-memory channels (per-process)

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::area::StorageArea;
use crate::backend::{validate_key, StorageBackend};
use crate::change::{ChangeEvent, ChangeSender, ChangeStream, StorageChange};
use crate::config::{item_size, AreaQuotas, AreaUsage, StorageConfig};
use crate::error::{Result, StorageError};

/// Writes read the old value and the area usage before writing. Taking the
/// write lock up front makes concurrent writers wait on `busy_timeout`
/// instead of failing with SQLITE_BUSY when a deferred read upgrades.
const WRITE_TRANSACTION: &str = "BEGIN IMMEDIATE";

/// SQLite implementation of [`StorageBackend`].
///
/// Watch notifications are in-process only: two processes sharing one
/// database file do not see each other's writes as change events.
pub struct SqliteBackend {
    pool: SqlitePool,
    quotas: AreaQuotas,
    notifier: ChangeSender,
}

impl SqliteBackend {
    /// Open or create a SQLite database at the given path.
    pub async fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite storage at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(config.sqlite.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.sqlite.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let backend = Self {
            pool,
            quotas: config.quotas.clone(),
            notifier: ChangeSender::new(config.change_capacity),
        };

        backend.init_schema().await?;
        backend.drop_session_rows().await?;
        Ok(backend)
    }

    /// Create an in-memory SQLite backend (for testing).
    pub async fn in_memory() -> Result<Self> {
        let config = StorageConfig::default();
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Every connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let backend = Self {
            pool,
            quotas: config.quotas,
            notifier: ChangeSender::new(config.change_capacity),
        };

        backend.init_schema().await?;
        Ok(backend)
    }

    /// Close the connection pool, waiting for open connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storage_items (
                area TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (area, key)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    async fn drop_session_rows(&self) -> Result<()> {
        let result = sqlx::query("DELETE FROM storage_items WHERE area = ?")
            .bind(StorageArea::Session.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            debug!(
                rows = result.rows_affected(),
                "dropped session storage from previous run"
            );
        }
        Ok(())
    }

    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    fn decode(text: &str) -> Result<Value> {
        serde_json::from_str(text).map_err(Into::into)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get(&self, area: StorageArea, key: &str, default: Value) -> Result<Value> {
        validate_key(key)?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM storage_items WHERE area = ? AND key = ?")
                .bind(area.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((text,)) => Self::decode(&text),
            None => Ok(default),
        }
    }

    async fn set(&self, area: StorageArea, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;

        let text = serde_json::to_string(&value)?;
        let mut tx = self.pool.begin_with(WRITE_TRANSACTION).await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT value FROM storage_items WHERE area = ? AND key = ?")
                .bind(area.as_str())
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        let old_value = existing.map(|(text,)| Self::decode(&text)).transpose()?;

        let (total_bytes, items): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0),
                   COUNT(*)
            FROM storage_items WHERE area = ?
            "#,
        )
        .bind(area.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let usage = AreaUsage {
            total_bytes: total_bytes as usize,
            items: items as usize,
            replaced_bytes: old_value.as_ref().map(|v| item_size(key, v)),
        };
        self.quotas.for_area(area).check(area, key, &value, &usage)?;

        sqlx::query(
            r#"
            INSERT INTO storage_items (area, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(area, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(area.as_str())
        .bind(key)
        .bind(&text)
        .bind(Self::now_unix())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.notifier.send(ChangeEvent::single(
            area,
            key,
            StorageChange::written(old_value, value),
        ));
        Ok(())
    }

    async fn remove(&self, area: StorageArea, key: &str) -> Result<()> {
        validate_key(key)?;

        let mut tx = self.pool.begin_with(WRITE_TRANSACTION).await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT value FROM storage_items WHERE area = ? AND key = ?")
                .bind(area.as_str())
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM storage_items WHERE area = ? AND key = ?")
            .bind(area.as_str())
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if let Some((text,)) = existing {
            self.notifier.send(ChangeEvent::single(
                area,
                key,
                StorageChange::removed(Self::decode(&text)?),
            ));
        }
        Ok(())
    }

    async fn clear(&self, area: StorageArea) -> Result<()> {
        let mut tx = self.pool.begin_with(WRITE_TRANSACTION).await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM storage_items WHERE area = ? ORDER BY key")
                .bind(area.as_str())
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM storage_items WHERE area = ?")
            .bind(area.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if !rows.is_empty() {
            let mut changes = BTreeMap::new();
            for (key, text) in rows {
                changes.insert(key, StorageChange::removed(Self::decode(&text)?));
            }
            self.notifier.send(ChangeEvent::new(area, changes));
        }
        Ok(())
    }

    async fn keys(&self, area: StorageArea) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM storage_items WHERE area = ? ORDER BY key")
                .bind(area.as_str())
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn bytes_in_use(&self, area: StorageArea, key: Option<&str>) -> Result<usize> {
        let (bytes,): (i64,) = match key {
            Some(key) => {
                sqlx::query_as(
                    r#"
                    SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                    FROM storage_items WHERE area = ? AND key = ?
                    "#,
                )
                .bind(area.as_str())
                .bind(key)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                    FROM storage_items WHERE area = ?
                    "#,
                )
                .bind(area.as_str())
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(bytes as usize)
    }

    fn subscribe(&self) -> ChangeStream {
        self.notifier.subscribe()
    }
}
