//! Session document stores for Turnstile.
//!
//! Every backend implements [`SessionStore`] with `append` as a single
//! compare-and-set on the session version. [`connect`] picks a backend from
//! the store URL scheme.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mongodb")]
pub mod mongo;

use std::sync::Arc;

use tracing::info;
use turnstile_core::error::StoreError;
use turnstile_core::store::SessionStore;

pub use in_memory::InMemorySessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresSessionStore;

#[cfg(feature = "mongodb")]
pub use mongo::MongoSessionStore;

/// Open the store named by `url`.
///
/// Supported schemes: `memory://`, `sqlite:`, `postgres://` (`postgresql://`)
/// and `mongodb://` (`mongodb+srv://`). All but the first need the matching
/// feature.
pub async fn connect(url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    let store: Arc<dyn SessionStore> = if url.starts_with("memory:") {
        Arc::new(InMemorySessionStore::new())
    } else if url.starts_with("sqlite:") {
        connect_sqlite(url).await?
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        connect_postgres(url).await?
    } else if url.starts_with("mongodb://") || url.starts_with("mongodb+srv://") {
        connect_mongo(url).await?
    } else {
        return Err(StoreError::UnsupportedUrl(scheme_of(url).to_string()));
    };

    info!(backend = store.name(), "Session store ready");
    Ok(store)
}

#[cfg(feature = "sqlite")]
async fn connect_sqlite(url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    Ok(Arc::new(SqliteSessionStore::new(url).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn connect_sqlite(_url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    Err(StoreError::UnsupportedUrl(
        "sqlite (built without the `sqlite` feature)".into(),
    ))
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    let store = PostgresSessionStore::connect(url).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    Err(StoreError::UnsupportedUrl(
        "postgres (built without the `postgres` feature)".into(),
    ))
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    Ok(Arc::new(MongoSessionStore::connect(url).await?))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(_url: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
    Err(StoreError::UnsupportedUrl(
        "mongodb (built without the `mongodb` feature)".into(),
    ))
}

/// The scheme part of a URL, never its credentials.
fn scheme_of(url: &str) -> &str {
    url.split(':').next().unwrap_or_default()
}

/// Classify a driver error: connectivity problems are `Unavailable`,
/// everything else is a `Backend` fault.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn map_sqlx(context: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(format!("{context}: {err}")),
        other => StoreError::Backend(format!("{context}: {other}")),
    }
}

/// Decode a JSON turns column.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn decode_turns(
    raw: &str,
) -> Result<Vec<turnstile_core::session::Turn>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Backend(format!("corrupt turns column: {e}")))
}
