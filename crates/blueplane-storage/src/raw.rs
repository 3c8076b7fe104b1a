//! Raw Trace Store
//!
//! Append-only compressed event log - the durability anchor of the whole
//! pipeline. Once a batch commits here, the events are safe regardless of
//! what happens to the streams or the derived stores.
//!
//! ## Why SQLite?
//!
//! The pipeline is local-first and single-writer. SQLite gives us ACID
//! batch transactions, WAL-mode concurrent readers, and zero operational
//! surface, which is exactly the contract §storage needs:
//! - `append` covers a whole batch in one transaction; a crash mid-commit
//!   rolls the entire batch back, never persisting a partial one
//! - `batch_id` is assigned by `AUTOINCREMENT`, so it strictly increases in
//!   commit order; the store fails fast if it ever observes otherwise
//! - records are never mutated after commit, only pruned by retention
//!
//! ## CDC Fallback
//!
//! The `cdc_unpublished` table records `(batch_id, index)` pairs whose CDC
//! append failed after the batch committed. A background sweeper drains it;
//! raw durability is never gated on the CDC stream being healthy.

use crate::codec::{decode_batch, encode_batch};
use crate::error::{Error, Result};
use crate::timefmt;
use async_trait::async_trait;
use blueplane_core::{BatchId, Event, SessionKey};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

/// Append-only access to the raw trace log.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Atomically persist a compressed batch and return its id.
    async fn append(&self, events: &[Event]) -> Result<BatchId>;

    /// Decompress a committed batch back to its events.
    async fn read(&self, batch_id: BatchId) -> Result<Vec<Event>>;

    /// Events for one session with `enqueued_at >= since`, oldest first.
    async fn scan(&self, session_key: &SessionKey, since: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Number of committed batches.
    async fn batch_count(&self) -> Result<u64>;

    /// Retention purge: drop batches written before `cutoff`. Returns how
    /// many were removed. Never invoked by the pipeline itself.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Record a CDC publish failure for later sweeping.
    async fn record_unpublished(&self, batch_id: BatchId, index: u32) -> Result<()>;

    /// Oldest recorded publish failures, up to `limit`.
    async fn take_unpublished(&self, limit: u32) -> Result<Vec<(BatchId, u32)>>;

    /// Clear a publish failure once the sweeper has re-published it.
    async fn clear_unpublished(&self, batch_id: BatchId, index: u32) -> Result<()>;
}

/// SQLite-backed raw store.
pub struct SqliteRawStore {
    pool: SqlitePool,
    last_batch_id: AtomicI64,
}

impl SqliteRawStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::init(pool).await?;
        info!(path = %path.as_ref().display(), "raw store opened");
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every handle on
    /// the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_traces (
                batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
                written_at TEXT NOT NULL,
                event_count INTEGER NOT NULL,
                first_enqueued_at TEXT NOT NULL,
                last_enqueued_at TEXT NOT NULL,
                codec_version INTEGER NOT NULL,
                blob BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_unpublished (
                batch_id INTEGER NOT NULL,
                event_index INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (batch_id, event_index)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let last: Option<i64> = sqlx::query("SELECT MAX(batch_id) AS max_id FROM raw_traces")
            .fetch_one(&pool)
            .await?
            .get("max_id");

        Ok(Self {
            pool,
            last_batch_id: AtomicI64::new(last.unwrap_or(0)),
        })
    }

    fn decode_row(batch_id: i64, codec: u8, event_count: i64, blob: &[u8]) -> Result<Vec<Event>> {
        let events = decode_batch(codec, blob)?;
        if events.len() as i64 != event_count {
            return Err(Error::Corrupted {
                batch_id,
                detail: format!(
                    "blob decodes to {} events, header says {}",
                    events.len(),
                    event_count
                ),
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl RawStore for SqliteRawStore {
    async fn append(&self, events: &[Event]) -> Result<BatchId> {
        if events.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let first_enqueued_at = events
            .iter()
            .map(|e| e.enqueued_at)
            .min()
            .unwrap_or_else(Utc::now);
        let last_enqueued_at = events
            .iter()
            .map(|e| e.enqueued_at)
            .max()
            .unwrap_or_else(Utc::now);
        let (codec, blob) = encode_batch(events)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO raw_traces
                (written_at, event_count, first_enqueued_at, last_enqueued_at, codec_version, blob)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(timefmt::encode(Utc::now()))
        .bind(events.len() as i64)
        .bind(timefmt::encode(first_enqueued_at))
        .bind(timefmt::encode(last_enqueued_at))
        .bind(codec as i64)
        .bind(&blob)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let batch_id = result.last_insert_rowid();
        let previous = self.last_batch_id.swap(batch_id, Ordering::SeqCst);
        if batch_id <= previous {
            return Err(Error::InvariantViolation(format!(
                "batch id went backward: {batch_id} after {previous}"
            )));
        }

        debug!(
            batch_id,
            events = events.len(),
            blob_bytes = blob.len(),
            "batch committed"
        );
        Ok(BatchId(batch_id))
    }

    async fn read(&self, batch_id: BatchId) -> Result<Vec<Event>> {
        let row = sqlx::query(
            "SELECT codec_version, event_count, blob FROM raw_traces WHERE batch_id = ?",
        )
        .bind(batch_id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::BatchNotFound(batch_id.0))?;

        let codec: i64 = row.get("codec_version");
        let event_count: i64 = row.get("event_count");
        let blob: Vec<u8> = row.get("blob");
        Self::decode_row(batch_id.0, codec as u8, event_count, &blob)
    }

    async fn scan(&self, session_key: &SessionKey, since: DateTime<Utc>) -> Result<Vec<Event>> {
        // Page over candidate batches only; the time window prunes most of
        // the log before any decompression happens.
        let rows = sqlx::query(
            r#"
            SELECT batch_id, codec_version, event_count, blob
            FROM raw_traces
            WHERE last_enqueued_at >= ?
            ORDER BY batch_id
            "#,
        )
        .bind(timefmt::encode(since))
        .fetch_all(&self.pool)
        .await?;

        let mut matched = Vec::new();
        for row in rows {
            let batch_id: i64 = row.get("batch_id");
            let codec: i64 = row.get("codec_version");
            let event_count: i64 = row.get("event_count");
            let blob: Vec<u8> = row.get("blob");
            for event in Self::decode_row(batch_id, codec as u8, event_count, &blob)? {
                if event.enqueued_at >= since && &event.session_key() == session_key {
                    matched.push(event);
                }
            }
        }
        Ok(matched)
    }

    async fn batch_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM raw_traces")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(count as u64)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM raw_traces WHERE written_at < ?")
            .bind(timefmt::encode(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_unpublished(&self, batch_id: BatchId, index: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO cdc_unpublished (batch_id, event_index, recorded_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(batch_id.0)
        .bind(index as i64)
        .bind(timefmt::encode(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_unpublished(&self, limit: u32) -> Result<Vec<(BatchId, u32)>> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, event_index FROM cdc_unpublished
            ORDER BY batch_id, event_index
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let batch_id: i64 = row.get("batch_id");
                let index: i64 = row.get("event_index");
                (BatchId(batch_id), index as u32)
            })
            .collect())
    }

    async fn clear_unpublished(&self, batch_id: BatchId, index: u32) -> Result<()> {
        sqlx::query("DELETE FROM cdc_unpublished WHERE batch_id = ? AND event_index = ?")
            .bind(batch_id.0)
            .bind(index as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
