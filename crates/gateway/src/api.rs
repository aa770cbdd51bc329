//! Chat and session endpoints.
//!
//! - `POST   /api/chat`            Send a message; `"stream": true` answers over SSE
//! - `POST   /api/sessions`        Create an empty session
//! - `GET    /api/sessions/{id}`   Read a session
//! - `DELETE /api/sessions/{id}`   Delete a session

use std::convert::Infallible;

use axum::{
    Router,
    body::Bytes,
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use turnstile_core::error::{RejectKind, ServiceError};
use turnstile_core::session::{Session, Turn};
use turnstile_orchestrator::ChatRequest;

use crate::SharedState;
use crate::error::ApiError;

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/sessions", post(create_session_handler))
        .route(
            "/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
}

// --- DTOs ---

/// `POST /api/chat` body: a chat request plus the streaming switch.
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(flatten)]
    pub request: ChatRequest,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    pub session_id: String,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

impl From<Session> for SessionDto {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id.to_string(),
            version: session.version,
            model: session.model,
            created_at: session.created_at,
            updated_at: session.updated_at,
            turns: session.turns,
        }
    }
}

// --- Handlers ---

async fn chat_handler(
    State(state): State<SharedState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    info!(
        session_id = body.request.session_id.as_deref().unwrap_or("<new>"),
        stream = body.stream,
        "Chat request"
    );

    if !body.stream {
        let response = state.orchestrator.handle(body.request).await?;
        return Ok(Json(response).into_response());
    }

    let rx = state.orchestrator.handle_stream(body.request).await?;
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(SseEvent::default().event(event.event_type()).data(data))
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn create_session_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SessionDto>), ApiError> {
    // An empty body creates a session with a generated id.
    let body: CreateSessionBody = if body.is_empty() {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::rejected(RejectKind::InvalidInput, e.to_string()))?
    };
    let session = state
        .orchestrator
        .create_session(body.session_id.as_deref(), body.model.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

async fn get_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDto>, ApiError> {
    let session = state.orchestrator.get_session(&id).await?;
    Ok(Json(session.into()))
}

async fn delete_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
