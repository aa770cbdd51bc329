//! Concurrency tests for the session stores.
//!
//! Every backend must serialize writers on the session version: of N
//! appends racing on the same expected version exactly one wins, and the
//! losers leave no trace.

use std::sync::Arc;

use turnstile_core::error::StoreError;
use turnstile_core::session::{SessionId, Turn};
use turnstile_core::store::SessionStore;
use turnstile_store::InMemorySessionStore;

// ── Shared scenarios ─────────────────────────────────────────────────────

fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

async fn racing_appends_have_single_winner(store: Arc<dyn SessionStore>) {
    store.create(Some(sid("race")), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .append(
                    &sid("race"),
                    vec![
                        Turn::user(format!("q{i}")),
                        Turn::assistant(format!("a{i}")),
                    ],
                    0,
                )
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(version) => {
                assert_eq!(version, 1);
                wins += 1;
            }
            Err(StoreError::VersionConflict { expected: 0, actual: 1, .. }) => conflicts += 1,
            Err(other) => panic!("unexpected store error: {other}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);

    let session = store.read(&sid("race")).await.unwrap();
    assert_eq!(session.version, 1);
    assert_eq!(session.turns.len(), 2);
    // The winning pair stays adjacent and in order.
    let q = session.turns[0].content.trim_start_matches('q');
    let a = session.turns[1].content.trim_start_matches('a');
    assert_eq!(q, a);
}

async fn sequential_writers_interleave_whole_pairs(store: Arc<dyn SessionStore>) {
    store.create(Some(sid("seq")), None).await.unwrap();

    // Each writer rereads and retries on conflict, like the orchestrator does.
    let mut handles = Vec::new();
    for i in 0..4 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            loop {
                let current = store.read(&sid("seq")).await.unwrap();
                let result = store
                    .append(
                        &sid("seq"),
                        vec![
                            Turn::user(format!("u{i}")),
                            Turn::assistant(format!("r{i}")),
                        ],
                        current.version,
                    )
                    .await;
                match result {
                    Ok(v) => return v,
                    Err(StoreError::VersionConflict { .. }) => tokio::task::yield_now().await,
                    Err(other) => panic!("unexpected store error: {other}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let session = store.read(&sid("seq")).await.unwrap();
    assert_eq!(session.version, 4);
    assert_eq!(session.turns.len(), 8);
    for pair in session.turns.chunks(2) {
        assert_eq!(
            pair[0].content.trim_start_matches('u'),
            pair[1].content.trim_start_matches('r')
        );
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_racing_appends_have_single_winner() {
    racing_appends_have_single_winner(Arc::new(InMemorySessionStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_retrying_writers_interleave_whole_pairs() {
    sequential_writers_interleave_whole_pairs(Arc::new(InMemorySessionStore::new())).await;
}

// ── SQLite ───────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
async fn sqlite_file_store(dir: &tempfile::TempDir) -> Arc<dyn SessionStore> {
    let url = format!("sqlite://{}", dir.path().join("race.db").display());
    turnstile_store::connect(&url).await.unwrap()
}

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_racing_appends_have_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    racing_appends_have_single_winner(sqlite_file_store(&dir).await).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_retrying_writers_interleave_whole_pairs() {
    let dir = tempfile::tempdir().unwrap();
    sequential_writers_interleave_whole_pairs(sqlite_file_store(&dir).await).await;
}

// ── MongoDB ──────────────────────────────────────────────────────────────
//
// Runs only when TURNSTILE_TEST_MONGODB_URL points at a live server.

#[cfg(feature = "mongodb")]
async fn mongo_store(ids: &[&str]) -> Option<Arc<dyn SessionStore>> {
    let Ok(url) = std::env::var("TURNSTILE_TEST_MONGODB_URL") else {
        eprintln!("TURNSTILE_TEST_MONGODB_URL not set; skipping MongoDB scenario");
        return None;
    };
    let store = turnstile_store::connect(&url).await.unwrap();
    for id in ids {
        store.delete(&sid(id)).await.unwrap();
    }
    Some(store)
}

#[cfg(feature = "mongodb")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mongo_racing_appends_have_single_winner() {
    if let Some(store) = mongo_store(&["race"]).await {
        racing_appends_have_single_winner(store).await;
    }
}

#[cfg(feature = "mongodb")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mongo_retrying_writers_interleave_whole_pairs() {
    if let Some(store) = mongo_store(&["seq"]).await {
        sequential_writers_interleave_whole_pairs(store).await;
    }
}

#[cfg(feature = "mongodb")]
#[tokio::test]
async fn mongo_missing_and_duplicate_sessions() {
    let Some(store) = mongo_store(&["mongo-edge"]).await else {
        return;
    };
    let err = store
        .append(&sid("mongo-edge"), vec![Turn::user("hi")], 0)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    store.create(Some(sid("mongo-edge")), None).await.unwrap();
    let err = store.create(Some(sid("mongo-edge")), None).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(id) if id == "mongo-edge"));
    assert!(store.delete(&sid("mongo-edge")).await.unwrap());
}
