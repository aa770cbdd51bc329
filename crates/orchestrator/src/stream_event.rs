//! Chat streaming events.
//!
//! What a streaming chat request emits, in order: any number of `chunk`
//! events, then exactly one `done` or `error`. The gateway forwards them
//! over SSE using [`ChatStreamEvent::event_type`] as the event name.

use serde::{Deserialize, Serialize};
use turnstile_core::error::ServiceError;
use turnstile_core::generation::FinishReason;
use turnstile_core::session::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// Partial text from the model.
    Chunk { content: String },

    /// The exchange was committed.
    ///
    /// With `finish_reason` `filtered` the stored assistant content is the
    /// filtered marker, whatever text was streamed before the filter hit.
    #[serde(rename_all = "camelCase")]
    Done {
        session_id: String,
        usage: Option<TokenUsage>,
        finish_reason: FinishReason,
        model: String,
        version: u64,
    },

    /// The request failed after the stream started.
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
}

impl ChatStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

impl From<&ServiceError> for ChatStreamEvent {
    fn from(err: &ServiceError) -> Self {
        let origin = match err {
            ServiceError::Failed { origin, .. } => Some(origin.as_str().to_string()),
            _ => None,
        };
        ChatStreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.public_message(),
            origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::error::FailureOrigin;

    #[test]
    fn chunk_serialization() {
        let event = ChatStreamEvent::Chunk {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""content":"Hello""#));
        assert_eq!(event.event_type(), "chunk");
    }

    #[test]
    fn done_serialization_is_camel_case() {
        let event = ChatStreamEvent::Done {
            session_id: "s1".into(),
            usage: None,
            finish_reason: FinishReason::Completed,
            model: "gpt-4o-mini".into(),
            version: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(json.contains(r#""sessionId":"s1""#));
        assert!(json.contains(r#""finishReason":"completed""#));
        assert_eq!(event.event_type(), "done");
    }

    #[test]
    fn error_event_hides_failure_detail() {
        let err = ServiceError::Failed {
            origin: FailureOrigin::Store,
            detail: "connection refused to 10.0.0.7:5432".into(),
        };
        let event = ChatStreamEvent::from(&err);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"failed""#));
        assert!(json.contains(r#""origin":"store""#));
        assert!(!json.contains("10.0.0.7"));
    }
}
