//! Metrics Store
//!
//! Rolling counters, gauges, and exponential-bucket histograms keyed by
//! `(scope, name, labels, bucket)`.
//!
//! ## Idempotence
//!
//! Aggregation must survive at-least-once delivery: re-applying the same
//! event cannot double-count. Every delta is applied through a conditional
//! update keyed by `(event_id, metric_key)` - the marker insert and the
//! metric mutation commit in one transaction, and an LRU cache in front of
//! the marker table absorbs duplicate floods without touching the database.
//!
//! ## Key Shape
//!
//! - **scope**: `global`, `session:<key>`, `tool:<name>`, `platform:<tag>`
//! - **name**: metric name (`events_total`, `tokens_total`, ...)
//! - **labels**: canonical `k=v,k=v` string, sorted by key
//! - **bucket**: time window id (`m:`/`h:`/`d:` prefix) or `-` for
//!   windowless values (gauges)
//! - **le**: histogram bucket bound, empty for counters and gauges
//!
//! Counter updates are monotonic and commutative, so concurrent workers can
//! increment the same key safely; SQLite serializes the upserts.

use crate::error::Result;
use crate::timefmt;
use async_trait::async_trait;
use blueplane_core::EventId;
use chrono::{DateTime, Utc};
use lru::LruCache;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::info;

/// Histogram bucket bounds in milliseconds: 1, 2, 4, ... 16384, then +Inf.
pub const LATENCY_BUCKETS_MS: &[u64] = &[
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Windowless bucket id for gauges.
pub const NO_BUCKET: &str = "-";

/// Minute-resolution window id, e.g. `m:2026-08-02T12:34`.
pub fn minute_bucket(at: DateTime<Utc>) -> String {
    format!("m:{}", at.format("%Y-%m-%dT%H:%M"))
}

/// Hour-resolution window id, e.g. `h:2026-08-02T12`.
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    format!("h:{}", at.format("%Y-%m-%dT%H"))
}

/// Day-resolution window id, e.g. `d:2026-08-02`.
pub fn day_bucket(at: DateTime<Utc>) -> String {
    format!("d:{}", at.format("%Y-%m-%d"))
}

/// Canonical label string from key/value pairs, sorted by key.
pub fn labels(pairs: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = pairs.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Aggregation scope of a metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetricScope {
    Global,
    Session(String),
    Tool(String),
    Platform(String),
}

impl MetricScope {
    pub fn as_key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Session(s) => format!("session:{s}"),
            Self::Tool(t) => format!("tool:{t}"),
            Self::Platform(p) => format!("platform:{p}"),
        }
    }
}

impl fmt::Display for MetricScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Full identity of one metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub scope: MetricScope,
    pub name: String,
    pub labels: String,
    pub bucket: String,
}

impl MetricKey {
    pub fn new(
        scope: MetricScope,
        name: impl Into<String>,
        labels: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            name: name.into(),
            labels: labels.into(),
            bucket: bucket.into(),
        }
    }

    /// Identity string used in the `(event_id, metric_key)` dedup index.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.scope.as_key(),
            self.name,
            self.labels,
            self.bucket
        )
    }
}

/// One mutation against a metric series.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOp {
    /// Monotonic counter increment.
    Incr(u64),
    /// Last-writer-wins gauge assignment.
    GaugeSet(f64),
    /// Relative gauge adjustment (e.g. active-session transitions).
    GaugeAdd(f64),
    /// Histogram observation in milliseconds.
    Observe(u64),
}

/// A metric mutation bound to its series.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDelta {
    pub key: MetricKey,
    pub op: MetricOp,
}

impl MetricDelta {
    pub fn new(key: MetricKey, op: MetricOp) -> Self {
        Self { key, op }
    }
}

/// Smallest exponential bucket bound holding `value_ms`, or `+Inf`.
pub fn le_bucket(value_ms: u64) -> String {
    for bound in LATENCY_BUCKETS_MS {
        if value_ms <= *bound {
            return bound.to_string();
        }
    }
    "+Inf".to_string()
}

/// Keyed counter/gauge/histogram storage.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Apply a delta set for one event, each delta conditional on
    /// `(event_id, metric_key)` not having been applied before. Returns how
    /// many deltas were actually applied.
    async fn apply(&self, event_id: &EventId, deltas: &[MetricDelta]) -> Result<u32>;

    /// Unconditional counter increment, for observational counters that are
    /// not tied to a single event (chain-of-custody accounting).
    async fn add_counter(&self, key: &MetricKey, n: u64) -> Result<()>;

    async fn counter_value(&self, key: &MetricKey) -> Result<u64>;

    /// Sum of a counter across all time buckets.
    async fn sum_counter(&self, scope: &MetricScope, name: &str, labels: &str) -> Result<u64>;

    /// Sum of a counter across an explicit set of buckets (sliding windows).
    async fn sum_counter_in(
        &self,
        scope: &MetricScope,
        name: &str,
        labels: &str,
        buckets: &[String],
    ) -> Result<u64>;

    async fn gauge_value(&self, key: &MetricKey) -> Result<Option<f64>>;

    /// Histogram bucket counts summed across time buckets, ordered by bound
    /// (`+Inf` last).
    async fn histogram_buckets(
        &self,
        scope: &MetricScope,
        name: &str,
        labels: &str,
    ) -> Result<Vec<(String, u64)>>;

    /// `accepted_total / suggestion_total` for a scope, `None` when no
    /// suggestions have been observed.
    async fn acceptance_rate(&self, scope: &MetricScope) -> Result<Option<f64>>;

    /// Drop dedup markers older than `cutoff`.
    async fn prune_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLite-backed metrics store with an LRU dedup cache in front of the
/// marker table.
pub struct SqliteMetricsStore {
    pool: SqlitePool,
    seen: Mutex<LruCache<(String, String), ()>>,
}

const SEEN_CACHE_CAPACITY: usize = 100_000;

impl SqliteMetricsStore {
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
        info!(path = %path.as_ref().display(), "metrics store opened");
        Ok(store)
    }

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
            CREATE TABLE IF NOT EXISTS metrics (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                labels TEXT NOT NULL,
                bucket TEXT NOT NULL,
                le TEXT NOT NULL DEFAULT '',
                counter INTEGER NOT NULL DEFAULT 0,
                gauge REAL,
                gauge_updated_at TEXT,
                PRIMARY KEY (scope, name, labels, bucket, le)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metric_applied (
                event_id TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (event_id, metric_key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let capacity = NonZeroUsize::new(SEEN_CACHE_CAPACITY)
            .expect("cache capacity is a nonzero constant");
        Ok(Self {
            pool,
            seen: Mutex::new(LruCache::new(capacity)),
        })
    }

    async fn upsert_counter<'e, E>(executor: E, key: &MetricKey, le: &str, n: u64) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO metrics (scope, name, labels, bucket, le, counter)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (scope, name, labels, bucket, le)
            DO UPDATE SET counter = counter + excluded.counter
            "#,
        )
        .bind(key.scope.as_key())
        .bind(&key.name)
        .bind(&key.labels)
        .bind(&key.bucket)
        .bind(le)
        .bind(n as i64)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn apply_op<'e, E>(executor: E, key: &MetricKey, op: &MetricOp) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        match op {
            MetricOp::Incr(n) => Self::upsert_counter(executor, key, "", *n).await,
            MetricOp::Observe(value_ms) => {
                Self::upsert_counter(executor, key, &le_bucket(*value_ms), 1).await
            }
            MetricOp::GaugeSet(value) => {
                sqlx::query(
                    r#"
                    INSERT INTO metrics (scope, name, labels, bucket, le, gauge, gauge_updated_at)
                    VALUES (?, ?, ?, ?, '', ?, ?)
                    ON CONFLICT (scope, name, labels, bucket, le)
                    DO UPDATE SET gauge = excluded.gauge,
                                  gauge_updated_at = excluded.gauge_updated_at
                    "#,
                )
                .bind(key.scope.as_key())
                .bind(&key.name)
                .bind(&key.labels)
                .bind(&key.bucket)
                .bind(value)
                .bind(timefmt::encode(Utc::now()))
                .execute(executor)
                .await?;
                Ok(())
            }
            MetricOp::GaugeAdd(delta) => {
                sqlx::query(
                    r#"
                    INSERT INTO metrics (scope, name, labels, bucket, le, gauge, gauge_updated_at)
                    VALUES (?, ?, ?, ?, '', ?, ?)
                    ON CONFLICT (scope, name, labels, bucket, le)
                    DO UPDATE SET gauge = COALESCE(metrics.gauge, 0) + excluded.gauge,
                                  gauge_updated_at = excluded.gauge_updated_at
                    "#,
                )
                .bind(key.scope.as_key())
                .bind(&key.name)
                .bind(&key.labels)
                .bind(&key.bucket)
                .bind(delta)
                .bind(timefmt::encode(Utc::now()))
                .execute(executor)
                .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn apply(&self, event_id: &EventId, deltas: &[MetricDelta]) -> Result<u32> {
        if deltas.is_empty() {
            return Ok(0);
        }

        // Cheap path: drop deltas this process has already applied.
        let mut fresh = Vec::with_capacity(deltas.len());
        {
            let mut seen = self.seen.lock().await;
            for delta in deltas {
                let cache_key = (event_id.as_str().to_string(), delta.key.dedup_key());
                if seen.get(&cache_key).is_none() {
                    fresh.push(delta);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut seen_keys = Vec::new();
        let mut applied: u32 = 0;
        for delta in &fresh {
            let dedup = delta.key.dedup_key();
            let marked = sqlx::query(
                "INSERT OR IGNORE INTO metric_applied (event_id, metric_key, recorded_at) VALUES (?, ?, ?)",
            )
            .bind(event_id.as_str())
            .bind(&dedup)
            .bind(timefmt::encode(Utc::now()))
            .execute(&mut *tx)
            .await?;

            if marked.rows_affected() == 0 {
                // Applied by an earlier run of this process or another
                // worker; remember it so the cache catches the next copy.
                seen_keys.push(dedup);
                continue;
            }

            Self::apply_op(&mut *tx, &delta.key, &delta.op).await?;
            seen_keys.push(dedup);
            applied += 1;
        }
        tx.commit().await?;

        // Populate the cache only after the markers are durable.
        let mut seen = self.seen.lock().await;
        for dedup in seen_keys {
            seen.put((event_id.as_str().to_string(), dedup), ());
        }

        Ok(applied)
    }

    async fn add_counter(&self, key: &MetricKey, n: u64) -> Result<()> {
        Self::upsert_counter(&self.pool, key, "", n).await
    }

    async fn counter_value(&self, key: &MetricKey) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT counter FROM metrics
            WHERE scope = ? AND name = ? AND labels = ? AND bucket = ? AND le = ''
            "#,
        )
        .bind(key.scope.as_key())
        .bind(&key.name)
        .bind(&key.labels)
        .bind(&key.bucket)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("counter") as u64).unwrap_or(0))
    }

    async fn sum_counter(&self, scope: &MetricScope, name: &str, labels: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(counter), 0) AS total FROM metrics
            WHERE scope = ? AND name = ? AND labels = ? AND le = ''
            "#,
        )
        .bind(scope.as_key())
        .bind(name)
        .bind(labels)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn sum_counter_in(
        &self,
        scope: &MetricScope,
        name: &str,
        labels: &str,
        buckets: &[String],
    ) -> Result<u64> {
        if buckets.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; buckets.len()].join(", ");
        let sql = format!(
            "SELECT COALESCE(SUM(counter), 0) AS total FROM metrics \
             WHERE scope = ? AND name = ? AND labels = ? AND le = '' AND bucket IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql)
            .bind(scope.as_key())
            .bind(name)
            .bind(labels);
        for bucket in buckets {
            query = query.bind(bucket);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn gauge_value(&self, key: &MetricKey) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT gauge FROM metrics
            WHERE scope = ? AND name = ? AND labels = ? AND bucket = ? AND le = ''
            "#,
        )
        .bind(key.scope.as_key())
        .bind(&key.name)
        .bind(&key.labels)
        .bind(&key.bucket)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get::<Option<f64>, _>("gauge")))
    }

    async fn histogram_buckets(
        &self,
        scope: &MetricScope,
        name: &str,
        labels: &str,
    ) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT le, SUM(counter) AS total FROM metrics
            WHERE scope = ? AND name = ? AND labels = ? AND le != ''
            GROUP BY le
            "#,
        )
        .bind(scope.as_key())
        .bind(name)
        .bind(labels)
        .fetch_all(&self.pool)
        .await?;

        let mut buckets: Vec<(String, u64)> = rows
            .into_iter()
            .map(|row| {
                let le: String = row.get("le");
                let total: i64 = row.get("total");
                (le, total as u64)
            })
            .collect();
        buckets.sort_by_key(|(le, _)| le.parse::<u64>().unwrap_or(u64::MAX));
        Ok(buckets)
    }

    async fn acceptance_rate(&self, scope: &MetricScope) -> Result<Option<f64>> {
        let suggestions = self.sum_counter(scope, "suggestion_total", "").await?;
        if suggestions == 0 {
            return Ok(None);
        }
        let accepted = self.sum_counter(scope, "accepted_total", "").await?;
        Ok(Some(accepted as f64 / suggestions as f64))
    }

    async fn prune_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM metric_applied WHERE recorded_at < ?")
            .bind(timefmt::encode(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
