//! Conversation Store
//!
//! Structured conversations reconstructed from telemetry: one `sessions`
//! row per `(platform, external_session_id)` pair and one `turns` row per
//! prompt/response pairing, with tool invocations folded into the turn as a
//! JSON blob (parent owns children; back-references go through `turn_id`).
//!
//! ## Idempotence
//!
//! Every mutation travels through [`ConversationStore::apply_update`], which
//! inserts into the `applied_events` dedup index and the data tables in one
//! transaction. Re-applying an already-seen event is a no-op, which is what
//! makes at-least-once delivery upstream harmless.

use crate::error::Result;
use crate::timefmt;
use async_trait::async_trait;
use blueplane_core::{EventId, SessionKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Dedup index identity of the conversation builder.
pub const CONVERSATION_BUILDER_ID: &str = "conversation_builder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

/// Tri-state acceptance signal on a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Unknown,
    Accepted,
    Rejected,
}

impl Accepted {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Unknown,
        }
    }
}

/// One session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub session_key: SessionKey,
    pub platform: String,
    pub external_session_id: String,
    pub workspace_hash: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Reference to a tool invocation observed inside a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub event_id: EventId,
    pub tool_name: Option<String>,
    pub at: DateTime<Utc>,
}

/// One reconstructed prompt/response turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRow {
    pub session_key: SessionKey,
    pub turn_id: i64,
    pub prompt_event_id: EventId,
    pub response_event_id: Option<EventId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub accepted: Accepted,
    pub tool_uses: Vec<ToolUse>,
}

impl TurnRow {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Access to sessions, turns, and the builder dedup index.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn session(&self, key: &SessionKey) -> Result<Option<SessionRow>>;

    /// All turns of a session, ordered by `turn_id`.
    async fn turns(&self, key: &SessionKey) -> Result<Vec<TurnRow>>;

    async fn latest_turn(&self, key: &SessionKey) -> Result<Option<TurnRow>>;

    /// Apply one event's mutations atomically, guarded by the dedup index.
    ///
    /// Returns `false` (and writes nothing) when `event_id` was already
    /// applied by the conversation builder.
    async fn apply_update(
        &self,
        event_id: &EventId,
        session: &SessionRow,
        turns: &[TurnRow],
    ) -> Result<bool>;

    async fn session_count(&self) -> Result<u64>;

    /// Drop dedup-index rows older than `cutoff` (rolling window matching
    /// raw-store retention). Returns how many were removed.
    async fn prune_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLite-backed conversation store.
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
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
        info!(path = %path.as_ref().display(), "conversation store opened");
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
            CREATE TABLE IF NOT EXISTS sessions (
                session_key TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                external_session_id TEXT NOT NULL,
                workspace_hash TEXT,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                session_key TEXT NOT NULL,
                turn_id INTEGER NOT NULL,
                prompt_event_id TEXT NOT NULL,
                response_event_id TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                accepted TEXT NOT NULL,
                tool_uses_blob TEXT NOT NULL,
                PRIMARY KEY (session_key, turn_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applied_events (
                event_id TEXT NOT NULL,
                builder_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (event_id, builder_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn turn_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TurnRow> {
        let session_key: String = row.get("session_key");
        let response_event_id: Option<String> = row.get("response_event_id");
        let completed_at: Option<String> = row.get("completed_at");
        let accepted: String = row.get("accepted");
        let started_at: String = row.get("started_at");
        let tool_uses_blob: String = row.get("tool_uses_blob");
        Ok(TurnRow {
            session_key: SessionKey::from_raw(session_key),
            turn_id: row.get("turn_id"),
            prompt_event_id: EventId::from_raw(row.get::<String, _>("prompt_event_id")),
            response_event_id: response_event_id.map(EventId::from_raw),
            started_at: timefmt::decode(&started_at)?,
            completed_at: completed_at.as_deref().map(timefmt::decode).transpose()?,
            accepted: Accepted::parse(&accepted),
            tool_uses: serde_json::from_str(&tool_uses_blob)?,
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn session(&self, key: &SessionKey) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let first_seen_at: String = row.get("first_seen_at");
            let last_seen_at: String = row.get("last_seen_at");
            let status: String = row.get("status");
            Ok(SessionRow {
                session_key: SessionKey::from_raw(row.get::<String, _>("session_key")),
                platform: row.get("platform"),
                external_session_id: row.get("external_session_id"),
                workspace_hash: row.get("workspace_hash"),
                first_seen_at: timefmt::decode(&first_seen_at)?,
                last_seen_at: timefmt::decode(&last_seen_at)?,
                status: SessionStatus::parse(&status),
            })
        })
        .transpose()
    }

    async fn turns(&self, key: &SessionKey) -> Result<Vec<TurnRow>> {
        let rows = sqlx::query("SELECT * FROM turns WHERE session_key = ? ORDER BY turn_id")
            .bind(key.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::turn_from_row).collect()
    }

    async fn latest_turn(&self, key: &SessionKey) -> Result<Option<TurnRow>> {
        let row = sqlx::query(
            "SELECT * FROM turns WHERE session_key = ? ORDER BY turn_id DESC LIMIT 1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::turn_from_row).transpose()
    }

    async fn apply_update(
        &self,
        event_id: &EventId,
        session: &SessionRow,
        turns: &[TurnRow],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "INSERT OR IGNORE INTO applied_events (event_id, builder_id, recorded_at) VALUES (?, ?, ?)",
        )
        .bind(event_id.as_str())
        .bind(CONVERSATION_BUILDER_ID)
        .bind(timefmt::encode(Utc::now()))
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            // Already applied; nothing to do and nothing to write.
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO sessions
                (session_key, platform, external_session_id, workspace_hash,
                 first_seen_at, last_seen_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_key) DO UPDATE SET
                workspace_hash = COALESCE(sessions.workspace_hash, excluded.workspace_hash),
                last_seen_at = excluded.last_seen_at,
                status = excluded.status
            "#,
        )
        .bind(session.session_key.as_str())
        .bind(&session.platform)
        .bind(&session.external_session_id)
        .bind(&session.workspace_hash)
        .bind(timefmt::encode(session.first_seen_at))
        .bind(timefmt::encode(session.last_seen_at))
        .bind(session.status.as_str())
        .execute(&mut *tx)
        .await?;

        for turn in turns {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO turns
                    (session_key, turn_id, prompt_event_id, response_event_id,
                     started_at, completed_at, accepted, tool_uses_blob)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(turn.session_key.as_str())
            .bind(turn.turn_id)
            .bind(turn.prompt_event_id.as_str())
            .bind(turn.response_event_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(timefmt::encode(turn.started_at))
            .bind(turn.completed_at.map(timefmt::encode))
            .bind(turn.accepted.as_str())
            .bind(serde_json::to_string(&turn.tool_uses)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn session_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sessions")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(count as u64)
    }

    async fn prune_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM applied_events WHERE recorded_at < ?")
            .bind(timefmt::encode(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_row(key: &SessionKey, status: SessionStatus) -> SessionRow {
        SessionRow {
            session_key: key.clone(),
            platform: "claude_code".to_string(),
            external_session_id: "s-1".to_string(),
            workspace_hash: None,
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            status,
        }
    }

    fn turn_row(key: &SessionKey, turn_id: i64) -> TurnRow {
        TurnRow {
            session_key: key.clone(),
            turn_id,
            prompt_event_id: EventId::generate(),
            response_event_id: None,
            started_at: Utc::now(),
            completed_at: None,
            accepted: Accepted::Unknown,
            tool_uses: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_apply_update_creates_session_and_turn() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("claude_code", "s-1");

        let applied = store
            .apply_update(
                &EventId::generate(),
                &session_row(&key, SessionStatus::Open),
                &[turn_row(&key, 1)],
            )
            .await
            .unwrap();
        assert!(applied);

        let session = store.session(&key).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Open);
        assert_eq!(store.turns(&key).await.unwrap().len(), 1);
        assert_eq!(store.session_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_apply_update_is_idempotent_per_event() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("claude_code", "s-1");
        let event_id = EventId::generate();
        let session = session_row(&key, SessionStatus::Open);

        assert!(store
            .apply_update(&event_id, &session, &[turn_row(&key, 1)])
            .await
            .unwrap());

        // Redelivery: same event id, would add a second turn if not guarded.
        let applied = store
            .apply_update(&event_id, &session, &[turn_row(&key, 2)])
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.turns(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_turns_ordered_and_latest() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("claude_code", "s-1");
        let session = session_row(&key, SessionStatus::Open);

        for turn_id in 1..=3 {
            store
                .apply_update(&EventId::generate(), &session, &[turn_row(&key, turn_id)])
                .await
                .unwrap();
        }

        let turns = store.turns(&key).await.unwrap();
        assert_eq!(
            turns.iter().map(|t| t.turn_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(store.latest_turn(&key).await.unwrap().unwrap().turn_id, 3);
    }

    #[tokio::test]
    async fn test_turn_replacement_updates_in_place() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("claude_code", "s-1");
        let session = session_row(&key, SessionStatus::Open);

        let mut turn = turn_row(&key, 1);
        store
            .apply_update(&EventId::generate(), &session, &[turn.clone()])
            .await
            .unwrap();

        // Close the turn via a later event.
        turn.response_event_id = Some(EventId::generate());
        turn.completed_at = Some(Utc::now());
        turn.accepted = Accepted::Rejected;
        turn.tool_uses.push(ToolUse {
            event_id: EventId::generate(),
            tool_name: Some("Edit".to_string()),
            at: Utc::now(),
        });
        store
            .apply_update(&EventId::generate(), &session, &[turn.clone()])
            .await
            .unwrap();

        let stored = store.latest_turn(&key).await.unwrap().unwrap();
        assert!(!stored.is_open());
        assert_eq!(stored.accepted, Accepted::Rejected);
        assert_eq!(stored.tool_uses.len(), 1);
        assert_eq!(stored.tool_uses[0].tool_name.as_deref(), Some("Edit"));
    }

    #[tokio::test]
    async fn test_workspace_hash_first_writer_wins() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("claude_code", "s-1");

        let mut session = session_row(&key, SessionStatus::Open);
        session.workspace_hash = Some("abc".to_string());
        store
            .apply_update(&EventId::generate(), &session, &[])
            .await
            .unwrap();

        session.workspace_hash = Some("other".to_string());
        store
            .apply_update(&EventId::generate(), &session, &[])
            .await
            .unwrap();

        let stored = store.session(&key).await.unwrap().unwrap();
        assert_eq!(stored.workspace_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_prune_applied_before() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("claude_code", "s-1");
        store
            .apply_update(
                &EventId::generate(),
                &session_row(&key, SessionStatus::Open),
                &[],
            )
            .await
            .unwrap();

        let removed = store
            .prune_applied_before(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let store = SqliteConversationStore::open_in_memory().await.unwrap();
        let key = SessionKey::derive("cursor", "never-seen");
        assert!(store.session(&key).await.unwrap().is_none());
        assert!(store.latest_turn(&key).await.unwrap().is_none());
        assert!(store.turns(&key).await.unwrap().is_empty());
    }
}
