//! The request orchestrator.
//!
//! One chat request runs through:
//!
//! 1. **Validate** the input and resolve generation parameters
//! 2. **Load** the session (creating it when allowed)
//! 3. **Generate** with a bounded window of the stored turns
//! 4. **Commit** the user and assistant turns in one conditional append
//!
//! Sessions are never locked in-process. Concurrent writers are serialized
//! by the store's version check; a conflicting commit re-reads once and
//! retries once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use turnstile_config::{AppConfig, GenerationConfig, SessionConfig};
use turnstile_core::error::{FailureOrigin, RejectKind, ServiceError, StoreError};
use turnstile_core::generation::{FinishReason, GenerationRequest, GenerationResult};
use turnstile_core::session::{Session, SessionId, Turn};
use turnstile_core::store::SessionStore;
use turnstile_providers::{GenerationClient, GenerationEvent};

use crate::context::ContextPolicy;
use crate::phase::{PhaseTracker, RequestPhase};
use crate::stream_event::ChatStreamEvent;
use crate::validate::{
    ChatRequest, ChatResponse, ValidatedRequest, check_model, parse_session_id, validate_request,
};

/// Content stored and returned in place of a filtered generation.
pub const FILTERED_MARKER: &str = "[content filtered]";

/// Settings the orchestrator reads on every request.
#[derive(Debug, Clone)]
struct Settings {
    generation: GenerationConfig,
    session: SessionConfig,
    policy: ContextPolicy,
}

/// Reachability of the two downstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub store: bool,
    pub provider: bool,
}

/// Drives chat requests against a store and a generation client.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    client: GenerationClient,
    settings: Arc<Settings>,
}

/// Everything needed to commit one exchange.
struct Exchange {
    session_id: SessionId,
    expected_version: u64,
    turns: Vec<Turn>,
    reply: GenerationResult,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SessionStore>, client: GenerationClient, config: &AppConfig) -> Self {
        Self {
            store,
            client,
            settings: Arc::new(Settings {
                generation: config.generation.clone(),
                session: config.session.clone(),
                policy: ContextPolicy::from(&config.session.context_window),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Handle a chat request end to end.
    ///
    /// Dropping the returned future before generation finishes cancels the
    /// provider call and appends nothing. Once the commit has started it
    /// runs to completion on its own task.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse, ServiceError> {
        let mut tracker = PhaseTracker::new();
        let result = self.run(&mut tracker, request).await;
        if let Err(e) = &result {
            tracker.fail(e);
            log_failure(&tracker, e);
        }
        result
    }

    async fn run(
        &self,
        tracker: &mut PhaseTracker,
        request: ChatRequest,
    ) -> Result<ChatResponse, ServiceError> {
        let (validated, session) = self.prepare(tracker, request).await?;
        let generation = self.generation_request(&session, &validated);

        tracker.advance(RequestPhase::Generating)?;
        let result = self.client.invoke(&generation).await?;

        let exchange = self.settle(&session, validated.content, result)?;
        tracker.advance(RequestPhase::Committing)?;
        let response = self.commit_detached(exchange).await?;
        tracker.advance(RequestPhase::Completed)?;

        info!(
            request_id = %tracker.request_id(),
            session_id = %response.session_id,
            version = response.version,
            finish_reason = %response.finish_reason,
            "Chat request completed"
        );
        Ok(response)
    }

    /// Handle a chat request, streaming deltas as they arrive.
    ///
    /// Validation and session loading happen before this returns, so their
    /// errors come back directly. After that every outcome is delivered on
    /// the channel, ending with exactly one `done` or `error` event. The
    /// generation keeps running and commits even if the receiver is dropped.
    pub async fn handle_stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>, ServiceError> {
        let mut tracker = PhaseTracker::new();
        let (validated, session) = match self.prepare(&mut tracker, request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracker.fail(&e);
                log_failure(&tracker, &e);
                return Err(e);
            }
        };
        let generation = self.generation_request(&session, &validated);

        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this
                .stream_exchange(&mut tracker, &session, validated.content, &generation, &tx)
                .await;
            let last = match outcome {
                Ok(response) => {
                    info!(
                        request_id = %tracker.request_id(),
                        session_id = %response.session_id,
                        version = response.version,
                        "Streaming chat request completed"
                    );
                    ChatStreamEvent::Done {
                        session_id: response.session_id,
                        usage: response.usage,
                        finish_reason: response.finish_reason,
                        model: response.model,
                        version: response.version,
                    }
                }
                Err(e) => {
                    tracker.fail(&e);
                    log_failure(&tracker, &e);
                    ChatStreamEvent::from(&e)
                }
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }

    async fn stream_exchange(
        &self,
        tracker: &mut PhaseTracker,
        session: &Session,
        content: String,
        generation: &GenerationRequest,
        tx: &mpsc::Sender<ChatStreamEvent>,
    ) -> Result<ChatResponse, ServiceError> {
        tracker.advance(RequestPhase::Generating)?;
        let mut stream = self.client.stream(generation);
        let mut outcome = None;
        let mut streamed_text = false;
        while let Some(event) = stream.next_event().await {
            match event {
                GenerationEvent::Delta(text) => {
                    streamed_text = true;
                    // A departed consumer must not stop accumulation.
                    let _ = tx.send(ChatStreamEvent::Chunk { content: text }).await;
                }
                GenerationEvent::Finished(result) => outcome = Some(result),
            }
        }
        let result = outcome.ok_or_else(|| ServiceError::Failed {
            origin: FailureOrigin::Internal,
            detail: "generation stream ended without an outcome".into(),
        })??;

        // After partial text the `done` finish reason tells the client.
        if result.finish_reason == FinishReason::Filtered && !streamed_text {
            let _ = tx
                .send(ChatStreamEvent::Chunk {
                    content: FILTERED_MARKER.into(),
                })
                .await;
        }

        let exchange = self.settle(session, content, result)?;
        tracker.advance(RequestPhase::Committing)?;
        let response = self.commit_detached(exchange).await?;
        tracker.advance(RequestPhase::Completed)?;
        Ok(response)
    }

    // --- Stages ---

    /// Validate and load context.
    async fn prepare(
        &self,
        tracker: &mut PhaseTracker,
        request: ChatRequest,
    ) -> Result<(ValidatedRequest, Session), ServiceError> {
        let validated =
            validate_request(request, &self.settings.generation, &self.settings.session)?;
        let session = self
            .load_or_create(validated.session_id.clone(), &validated.params.model)
            .await?;
        tracker.advance(RequestPhase::ContextLoaded)?;
        debug!(
            request_id = %tracker.request_id(),
            session_id = %session.id,
            version = session.version,
            turns = session.turns.len(),
            "Session loaded"
        );
        Ok((validated, session))
    }

    async fn load_or_create(
        &self,
        id: Option<SessionId>,
        model: &str,
    ) -> Result<Session, ServiceError> {
        let Some(id) = id else {
            return self
                .store
                .create(None, Some(model))
                .await
                .map_err(|e| ServiceError::store_failure(&e));
        };

        match self.store.read(&id).await {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound(_)) if self.settings.session.allow_create => {
                match self.store.create(Some(id.clone()), Some(model)).await {
                    Ok(session) => Ok(session),
                    // Another request created it first; use theirs.
                    Err(StoreError::AlreadyExists(_)) => self
                        .store
                        .read(&id)
                        .await
                        .map_err(|e| ServiceError::store_failure(&e)),
                    Err(e) => Err(ServiceError::store_failure(&e)),
                }
            }
            Err(StoreError::NotFound(_)) => Err(unknown_session(&id)),
            Err(e) => Err(ServiceError::store_failure(&e)),
        }
    }

    fn generation_request(
        &self,
        session: &Session,
        validated: &ValidatedRequest,
    ) -> GenerationRequest {
        let window = self.settings.policy.window(&session.turns);
        if window.len() < session.turns.len() {
            debug!(
                session_id = %session.id,
                kept = window.len(),
                dropped = session.turns.len() - window.len(),
                "Context window truncated"
            );
        }
        GenerationRequest::new(
            window.to_vec(),
            validated.content.clone(),
            validated.params.clone(),
        )
        .with_system_prompt(self.settings.session.system_prompt.clone())
    }

    /// Decide which turns a generation result commits.
    fn settle(
        &self,
        session: &Session,
        content: String,
        mut reply: GenerationResult,
    ) -> Result<Exchange, ServiceError> {
        let user = Turn::user(content);
        let turns = match reply.finish_reason {
            FinishReason::Error => {
                return Err(ServiceError::Failed {
                    origin: FailureOrigin::Provider,
                    detail: "provider reported an error finish reason".into(),
                });
            }
            FinishReason::Filtered => {
                warn!(session_id = %session.id, "Generation filtered by provider");
                reply.content = FILTERED_MARKER.into();
                if self.settings.session.persist_filtered {
                    vec![user, assistant_turn(&reply)]
                } else {
                    vec![user]
                }
            }
            FinishReason::Interrupted => {
                warn!(
                    session_id = %session.id,
                    received = reply.content.len(),
                    "Committing interrupted generation"
                );
                vec![user, assistant_turn(&reply)]
            }
            FinishReason::Completed | FinishReason::Length => vec![user, assistant_turn(&reply)],
        };
        Ok(Exchange {
            session_id: session.id.clone(),
            expected_version: session.version,
            turns,
            reply,
        })
    }

    /// Run the commit on its own task so a departed caller cannot abort it.
    async fn commit_detached(&self, exchange: Exchange) -> Result<ChatResponse, ServiceError> {
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            let version = commit(
                store.as_ref(),
                &exchange.session_id,
                exchange.turns,
                exchange.expected_version,
            )
            .await?;
            let reply = exchange.reply;
            Ok::<_, ServiceError>(ChatResponse {
                session_id: exchange.session_id.to_string(),
                degraded: reply.is_degraded(),
                content: reply.content,
                usage: reply.usage,
                finish_reason: reply.finish_reason,
                model: reply.model,
                version,
            })
        });

        handle.await.map_err(|e| ServiceError::Failed {
            origin: FailureOrigin::Internal,
            detail: format!("commit task failed: {e}"),
        })?
    }

    // --- Session management ---

    /// Create an empty session.
    pub async fn create_session(
        &self,
        session_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<Session, ServiceError> {
        let id = session_id.map(parse_session_id).transpose()?;
        let model = model.unwrap_or(&self.settings.generation.default_model);
        check_model(model, &self.settings.generation)?;

        match self.store.create(id, Some(model)).await {
            Ok(session) => {
                info!(session_id = %session.id, "Session created");
                Ok(session)
            }
            Err(StoreError::AlreadyExists(id)) => Err(ServiceError::rejected(
                RejectKind::SessionExists,
                format!("session {id:?} already exists"),
            )),
            Err(e) => Err(ServiceError::store_failure(&e)),
        }
    }

    /// Fetch a session document.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, ServiceError> {
        let id = parse_session_id(session_id)?;
        match self.store.read(&id).await {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound(_)) => Err(unknown_session(&id)),
            Err(e) => Err(ServiceError::store_failure(&e)),
        }
    }

    /// Delete a session. Unknown ids are rejected.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ServiceError> {
        let id = parse_session_id(session_id)?;
        match self.store.delete(&id).await {
            Ok(true) => {
                info!(session_id = %id, "Session deleted");
                Ok(())
            }
            Ok(false) => Err(unknown_session(&id)),
            Err(e) => Err(ServiceError::store_failure(&e)),
        }
    }

    /// Probe the store and the provider.
    pub async fn health(&self) -> HealthReport {
        let (store, provider) = tokio::join!(
            self.store.health_check(),
            self.client.provider().health_check()
        );
        HealthReport {
            store: store.unwrap_or(false),
            provider: provider.unwrap_or(false),
        }
    }
}

/// Append with the single documented conflict retry.
async fn commit(
    store: &dyn SessionStore,
    id: &SessionId,
    turns: Vec<Turn>,
    expected_version: u64,
) -> Result<u64, ServiceError> {
    let first = store.append(id, turns.clone(), expected_version).await;
    let err = match first {
        Ok(version) => return Ok(version),
        Err(err) => err,
    };

    let StoreError::VersionConflict { actual, .. } = err else {
        error!(session_id = %id, error = %err, "Generated output could not be persisted");
        return Err(ServiceError::store_failure(&err));
    };

    debug!(session_id = %id, expected_version, actual, "Version conflict, re-reading once");
    let retry = async {
        let fresh = store.read(id).await?;
        store.append(id, turns, fresh.version).await
    };
    retry.await.map_err(|e| {
        error!(session_id = %id, error = %e, "Generated output could not be persisted after retry");
        ServiceError::store_failure(&e)
    })
}

fn assistant_turn(reply: &GenerationResult) -> Turn {
    Turn::assistant(reply.content.clone())
        .with_usage(reply.usage)
        .with_finish_reason(reply.finish_reason)
}

fn unknown_session(id: &SessionId) -> ServiceError {
    ServiceError::rejected(
        RejectKind::UnknownSession,
        format!("session {:?} not found", id.as_str()),
    )
}

fn log_failure(tracker: &PhaseTracker, err: &ServiceError) {
    match err {
        ServiceError::Rejected { .. } => {
            debug!(request_id = %tracker.request_id(), error = %err, "Chat request rejected");
        }
        _ => {
            warn!(
                request_id = %tracker.request_id(),
                kind = err.kind(),
                error = %err,
                "Chat request failed"
            );
        }
    }
}
