//! SQLite session store.
//!
//! One row per session. Turns are kept as a JSON array in a TEXT column and
//! `version` guards every write:
//!
//! ```sql
//! UPDATE sessions SET turns = ?, version = version + 1, ...
//! WHERE id = ? AND version = ?
//! ```
//!
//! A concurrent writer that got there first leaves zero rows affected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use turnstile_core::error::StoreError;
use turnstile_core::session::{Session, SessionId, Turn};
use turnstile_core::store::SessionStore;

use crate::{decode_turns, map_sqlx};

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (creating if missing) the database at `url`.
    ///
    /// `sqlite::memory:` gives an ephemeral database; it is pinned to a
    /// single connection so every query sees the same data.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Backend(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx("open SQLite", e))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite session store initialized at {url}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          TEXT PRIMARY KEY NOT NULL,
                turns       TEXT NOT NULL DEFAULT '[]',
                version     INTEGER NOT NULL DEFAULT 0,
                model       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("sessions table", e))?;

        debug!("SQLite session schema ready");
        Ok(())
    }

    fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| map_sqlx("id column", e))?;
        let turns: String = row
            .try_get("turns")
            .map_err(|e| map_sqlx("turns column", e))?;
        let version: i64 = row
            .try_get("version")
            .map_err(|e| map_sqlx("version column", e))?;
        let model: Option<String> = row
            .try_get("model")
            .map_err(|e| map_sqlx("model column", e))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| map_sqlx("created_at column", e))?;
        let updated_at: String = row
            .try_get("updated_at")
            .map_err(|e| map_sqlx("updated_at column", e))?;

        Ok(Session {
            id: SessionId::parse(&id)
                .map_err(|e| StoreError::Backend(format!("stored id {id:?}: {e}")))?,
            turns: decode_turns(&turns)?,
            version: version as u64,
            model,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    async fn fetch(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("read session", e))?;
        row.as_ref().map(Self::row_to_session).transpose()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn read(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn append(
        &self,
        id: &SessionId,
        turns: Vec<Turn>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut current = self.read(id).await?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let new_version = current.apply_append(turns);
        let encoded = serde_json::to_string(&current.turns)
            .map_err(|e| StoreError::Backend(format!("encode turns: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET turns = ?1, version = version + 1, updated_at = ?2
            WHERE id = ?3 AND version = ?4
            "#,
        )
        .bind(&encoded)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.as_str())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("append turns", e))?;

        if result.rows_affected() == 0 {
            // Lost the race between the read and the guarded update.
            let actual = self.read(id).await?.version;
            return Err(StoreError::VersionConflict {
                session_id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        debug!(session_id = %id, version = new_version, "Appended turns");
        Ok(new_version)
    }

    async fn create(
        &self,
        id: Option<SessionId>,
        model: Option<&str>,
    ) -> Result<Session, StoreError> {
        let session = Session::new(id.unwrap_or_else(SessionId::generate), model.map(String::from));

        let result = sqlx::query(
            r#"
            INSERT INTO sessions (id, turns, version, model, created_at, updated_at)
            VALUES (?1, '[]', 0, ?2, ?3, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(session.id.as_str())
        .bind(&session.model)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("create session", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(session.id.to_string()));
        }
        debug!(session_id = %session.id, "Created session");
        Ok(session)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("delete session", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("health check", e))?;
        Ok(true)
    }
}
