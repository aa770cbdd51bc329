//! SessionStore trait: typed access to session documents.
//!
//! The store is the single serialization point for concurrent writers:
//! `append` is a compare-and-set on the session version. Implementations
//! never retry; transient failures are surfaced to the caller.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::{Session, SessionId, Turn};

/// The core SessionStore trait.
///
/// Implementations: in-memory (tests, single process), SQLite, PostgreSQL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "postgres", "memory").
    fn name(&self) -> &str;

    /// Fetch the current committed state of a session.
    async fn read(&self, id: &SessionId) -> std::result::Result<Session, StoreError>;

    /// Append `turns` in order if the stored version equals `expected_version`.
    ///
    /// Returns the new version. Either all turns are appended or none are.
    async fn append(
        &self,
        id: &SessionId,
        turns: Vec<Turn>,
        expected_version: u64,
    ) -> std::result::Result<u64, StoreError>;

    /// Create an empty session, generating an identifier when none is given.
    async fn create(
        &self,
        id: Option<SessionId>,
        model: Option<&str>,
    ) -> std::result::Result<Session, StoreError>;

    /// Delete a session. Returns whether it existed.
    async fn delete(&self, id: &SessionId) -> std::result::Result<bool, StoreError>;

    /// Health check: can we reach the store?
    async fn health_check(&self) -> std::result::Result<bool, StoreError> {
        Ok(true)
    }
}
