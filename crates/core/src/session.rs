//! Session and Turn domain types.
//!
//! A [`Session`] is the persisted, ordered conversation between a caller and
//! the assistant. Its [`Turn`]s are immutable once appended and are kept in
//! conversation order by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::generation::FinishReason;

/// Longest caller-supplied session identifier accepted.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a caller-supplied identifier.
    ///
    /// Accepts 1 to [`MAX_SESSION_ID_LEN`] characters drawn from
    /// `[A-Za-z0-9._:-]`. Returns a human-readable reason on rejection.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("session id must not be empty".into());
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(format!(
                "session id must be at most {MAX_SESSION_ID_LEN} characters"
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(format!("session id contains invalid character {bad:?}"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The role a turn is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The language model
    Assistant,
    /// Instructions injected by the service
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Token usage reported by the provider for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One message within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced this turn
    pub role: Role,

    /// The text content
    pub content: String,

    /// When the turn was produced
    pub timestamp: DateTime<Utc>,

    /// Token accounting, present on assistant turns when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// How generation ended, present on assistant turns only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl Turn {
    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            usage: None,
            finish_reason: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

/// A persisted conversation.
///
/// `version` is the optimistic-concurrency counter: 0 when created, and
/// incremented by exactly one per successful append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,

    /// Committed turns in conversation order
    pub turns: Vec<Turn>,

    /// Monotonic write counter
    pub version: u64,

    /// Provider model identifier the session was opened with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// When this session was created
    pub created_at: DateTime<Utc>,

    /// When the last append was committed
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new empty session at version 0.
    pub fn new(id: SessionId, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            turns: Vec::new(),
            version: 0,
            model,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a committed append: extend the turns and bump the version.
    ///
    /// Stores call this only after the version check passed.
    pub fn apply_append(&mut self, turns: Vec<Turn>) -> u64 {
        self.turns.extend(turns);
        self.version += 1;
        self.updated_at = Utc::now();
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_reasonable_ids() {
        assert!(SessionId::parse("s1").is_ok());
        assert!(SessionId::parse("user-42:thread_7.v2").is_ok());
        assert!(SessionId::parse(&"a".repeat(MAX_SESSION_ID_LEN)).is_ok());
    }

    #[test]
    fn parse_rejects_bad_ids() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("has space").is_err());
        assert!(SessionId::parse("slash/y").is_err());
        assert!(SessionId::parse(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn new_session_starts_at_version_zero() {
        let session = Session::new(SessionId::parse("s1").unwrap(), None);
        assert_eq!(session.version, 0);
        assert!(session.is_empty());
    }

    #[test]
    fn apply_append_bumps_version_once_per_call() {
        let mut session = Session::new(SessionId::parse("s1").unwrap(), None);
        let v = session.apply_append(vec![Turn::user("hi"), Turn::assistant("hello")]);
        assert_eq!(v, 1);
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[0].role, Role::User);
        assert_eq!(session.turns[1].role, Role::Assistant);
        assert!(session.updated_at >= session.created_at);
    }

    #[test]
    fn turn_serializes_role_lowercase() {
        let turn = Turn::assistant("ok").with_finish_reason(FinishReason::Completed);
        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains(r#""role":"assistant""#));
        assert!(json.contains(r#""finish_reason":"completed""#));
        assert!(!json.contains("usage"));
    }
}
