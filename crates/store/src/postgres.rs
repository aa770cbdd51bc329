//! PostgreSQL session store.
//!
//! Turns live in a JSONB array. Append is one statement that both checks the
//! version and concatenates the new turns, so no read is needed on the happy
//! path.
//!
//! # Feature gate
//!
//! ```toml
//! turnstile-store = { workspace = true, features = ["postgres"] }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::{debug, info};
use turnstile_core::error::StoreError;
use turnstile_core::session::{Session, SessionId, Turn};
use turnstile_core::store::SessionStore;

use crate::{decode_turns, map_sqlx};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    turns       JSONB NOT NULL DEFAULT '[]'::jsonb,
    version     BIGINT NOT NULL DEFAULT 0,
    model       TEXT,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
)
"#;

pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    /// Connect to the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx("PostgreSQL connection", e))?;

        info!("Connected to PostgreSQL for session store");
        Ok(Self { pool })
    }

    /// Create the sessions table if it does not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("session schema migration", e))?;
        debug!("PostgreSQL session schema ready");
        Ok(())
    }

    async fn current_version(&self, id: &SessionId) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT version FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("read version", e))?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }
}

fn row_to_session(row: &PgRow) -> Result<Session, StoreError> {
    let id: String = row.get("id");
    let turns: String = row.get("turns_text");
    Ok(Session {
        id: SessionId::parse(&id)
            .map_err(|e| StoreError::Backend(format!("stored id {id:?}: {e}")))?,
        turns: decode_turns(&turns)?,
        version: row.get::<i64, _>("version") as u64,
        model: row.get("model"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn read(&self, id: &SessionId) -> Result<Session, StoreError> {
        let row = sqlx::query(
            "SELECT id, turns::text AS turns_text, version, model, created_at, updated_at \
             FROM sessions WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("read session", e))?;

        match row {
            Some(row) => row_to_session(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn append(
        &self,
        id: &SessionId,
        turns: Vec<Turn>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let encoded = serde_json::to_string(&turns)
            .map_err(|e| StoreError::Backend(format!("encode turns: {e}")))?;

        let row = sqlx::query(
            r#"
            UPDATE sessions
            SET turns = turns || $2::jsonb, version = version + 1, updated_at = $3
            WHERE id = $1 AND version = $4
            RETURNING version
            "#,
        )
        .bind(id.as_str())
        .bind(&encoded)
        .bind(Utc::now())
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("append turns", e))?;

        match row {
            Some(row) => {
                let version = row.get::<i64, _>("version") as u64;
                debug!(session_id = %id, version, "Appended turns");
                Ok(version)
            }
            None => match self.current_version(id).await? {
                Some(actual) => Err(StoreError::VersionConflict {
                    session_id: id.to_string(),
                    expected: expected_version,
                    actual,
                }),
                None => Err(StoreError::NotFound(id.to_string())),
            },
        }
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
            VALUES ($1, '[]'::jsonb, 0, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session.id.as_str())
        .bind(&session.model)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("create session", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(session.id.to_string()));
        }
        Ok(session)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
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
