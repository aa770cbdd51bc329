//! In-memory store: useful for testing and single-process deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use turnstile_core::error::StoreError;
use turnstile_core::session::{Session, SessionId, Turn};
use turnstile_core::store::SessionStore;

/// A store that keeps session documents in a map.
///
/// The write lock is the serialization point: the version check and the
/// append happen under the same guard.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn append(
        &self,
        id: &SessionId,
        turns: Vec<Turn>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if session.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: id.to_string(),
                expected: expected_version,
                actual: session.version,
            });
        }

        Ok(session.apply_append(turns))
    }

    async fn create(
        &self,
        id: Option<SessionId>,
        model: Option<&str>,
    ) -> Result<Session, StoreError> {
        let id = id.unwrap_or_else(SessionId::generate);
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let session = Session::new(id.clone(), model.map(String::from));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }
}
