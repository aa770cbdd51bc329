//! MongoDB session store.
//!
//! One document per session in the `sessions` collection, keyed by `_id`.
//! Append is a single conditional update:
//!
//! ```text
//! update_one({ _id: id, version: expected },
//!            { $push: { turns: { $each: [...] } }, $inc: { version: 1 } })
//! ```
//!
//! No match means the version moved or the session is gone; a follow-up
//! read tells the two apart.
//!
//! # Feature gate
//!
//! ```toml
//! turnstile-store = { workspace = true, features = ["mongodb"] }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use turnstile_core::error::StoreError;
use turnstile_core::session::{Session, SessionId, Turn};
use turnstile_core::store::SessionStore;

/// Used when the URL names no database.
const DEFAULT_DATABASE: &str = "turnstile";
const COLLECTION: &str = "sessions";
const DUPLICATE_KEY: i32 = 11000;

/// A session as stored in MongoDB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(rename = "_id")]
    id: String,
    turns: Vec<Turn>,
    version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionDocument {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            turns: session.turns.clone(),
            version: session.version as i64,
            model: session.model.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

impl TryFrom<SessionDocument> for Session {
    type Error = StoreError;

    fn try_from(document: SessionDocument) -> Result<Self, StoreError> {
        let id = SessionId::parse(&document.id)
            .map_err(|e| StoreError::Backend(format!("stored id {:?}: {e}", document.id)))?;
        Ok(Session {
            id,
            turns: document.turns,
            version: document.version as u64,
            model: document.model,
            created_at: document.created_at,
            updated_at: document.updated_at,
        })
    }
}

pub struct MongoSessionStore {
    database: Database,
    sessions: Collection<SessionDocument>,
}

impl MongoSessionStore {
    /// Connect to the deployment at `url`.
    ///
    /// The database comes from the URL path (`mongodb://host/chat`), falling
    /// back to `turnstile`. The driver connects lazily, so an unreachable
    /// server surfaces on the first operation or [`SessionStore::health_check`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(|e| map_mongo("MongoDB connection", e))?;
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));
        let sessions = database.collection::<SessionDocument>(COLLECTION);

        info!(database = database.name(), "MongoDB session store initialized");
        Ok(Self { database, sessions })
    }

    async fn fetch(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.sessions
            .find_one(doc! { "_id": id.as_str() })
            .await
            .map_err(|e| map_mongo("read session", e))?
            .map(Session::try_from)
            .transpose()
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    fn name(&self) -> &str {
        "mongodb"
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
        let pushed = bson::to_bson(&turns)
            .map_err(|e| StoreError::Backend(format!("encode turns: {e}")))?;
        let updated_at = bson::to_bson(&Utc::now())
            .map_err(|e| StoreError::Backend(format!("encode timestamp: {e}")))?;
        let expected = expected_version as i64;

        let result = self
            .sessions
            .update_one(
                doc! { "_id": id.as_str(), "version": expected },
                doc! {
                    "$push": { "turns": { "$each": pushed } },
                    "$inc": { "version": 1_i64 },
                    "$set": { "updated_at": updated_at },
                },
            )
            .await
            .map_err(|e| map_mongo("append turns", e))?;

        if result.matched_count == 0 {
            let actual = self.read(id).await?.version;
            return Err(StoreError::VersionConflict {
                session_id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let new_version = expected_version + 1;
        debug!(session_id = %id, version = new_version, "Appended turns");
        Ok(new_version)
    }

    async fn create(
        &self,
        id: Option<SessionId>,
        model: Option<&str>,
    ) -> Result<Session, StoreError> {
        let session = Session::new(id.unwrap_or_else(SessionId::generate), model.map(String::from));

        match self.sessions.insert_one(SessionDocument::from(&session)).await {
            Ok(_) => {
                debug!(session_id = %session.id, "Created session");
                Ok(session)
            }
            Err(e) if is_duplicate_key(&e) => Err(StoreError::AlreadyExists(session.id.to_string())),
            Err(e) => Err(map_mongo("create session", e)),
        }
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let result = self
            .sessions
            .delete_one(doc! { "_id": id.as_str() })
            .await
            .map_err(|e| map_mongo("delete session", e))?;
        Ok(result.deleted_count > 0)
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| map_mongo("health check", e))?;
        Ok(true)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

/// Same split as the SQL backends: reachability problems are `Unavailable`.
fn map_mongo(context: &str, err: mongodb::error::Error) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => StoreError::Unavailable(format!("{context}: {err}")),
        _ => StoreError::Backend(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::generation::FinishReason;
    use turnstile_core::session::{Role, TokenUsage};

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn session_document_survives_bson() {
        let mut session = Session::new(sid("s1"), Some("gpt-4o-mini".into()));
        session.apply_append(vec![
            Turn::user("hi"),
            Turn::assistant("hello")
                .with_usage(Some(TokenUsage {
                    prompt_tokens: 3,
                    completion_tokens: 2,
                    total_tokens: 5,
                }))
                .with_finish_reason(FinishReason::Completed),
        ]);

        let encoded = bson::to_document(&SessionDocument::from(&session)).unwrap();
        assert_eq!(encoded.get_str("_id").unwrap(), "s1");
        assert_eq!(encoded.get_i64("version").unwrap(), 1);

        let decoded: SessionDocument = bson::from_document(encoded).unwrap();
        let restored = Session::try_from(decoded).unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(restored.turns, session.turns);
        assert_eq!(restored.turns[1].role, Role::Assistant);
        assert_eq!(restored.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn corrupt_stored_id_is_backend_error() {
        let document = SessionDocument {
            id: "not a valid id!".into(),
            turns: Vec::new(),
            version: 0,
            model: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(Session::try_from(document), Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn connect_is_lazy_and_reads_database_from_url() {
        let store = MongoSessionStore::connect("mongodb://127.0.0.1:1/chat").await.unwrap();
        assert_eq!(store.name(), "mongodb");
        assert_eq!(store.database.name(), "chat");

        let store = MongoSessionStore::connect("mongodb://127.0.0.1:1").await.unwrap();
        assert_eq!(store.database.name(), DEFAULT_DATABASE);
    }
}
