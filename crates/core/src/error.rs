//! Error types for the Turnstile domain.
//!
//! Each bounded context has its own `thiserror` enum. [`ServiceError`] is the
//! caller-facing taxonomy the orchestrator reduces everything to.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on session {session_id}: expected {expected}, found {actual}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Unsupported store URL: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Failures where the request never produced output and may be resent as-is.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::StreamInterrupted(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    #[error("Provider rejected the request: {0}")]
    Provider(ProviderError),

    #[error("Provider unreachable after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    #[error("Generation aborted: {0}")]
    Aborted(String),
}

/// Why a request was turned away before any work was done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Malformed or out-of-range input
    InvalidInput,
    /// Content longer than the configured limit
    ContentTooLong,
    /// Model identifier not on the allow-list
    UnknownModel,
    /// Session id not found and creation not permitted
    UnknownSession,
    /// Explicit create of an id that is taken
    SessionExists,
}

/// Where an unrecoverable failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    Store,
    Provider,
    Internal,
}

impl FailureOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOrigin::Store => "store",
            FailureOrigin::Provider => "provider",
            FailureOrigin::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing outcome of a failed request.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Request rejected: {message}")]
    Rejected { kind: RejectKind, message: String },

    #[error("Generation timed out after {after_secs}s")]
    GenerationTimeout { after_secs: u64 },

    #[error("Request failed ({origin}): {detail}")]
    Failed {
        origin: FailureOrigin,
        detail: String,
    },
}

impl ServiceError {
    pub fn rejected(kind: RejectKind, message: impl Into<String>) -> Self {
        ServiceError::Rejected {
            kind,
            message: message.into(),
        }
    }

    pub fn store_failure(err: &StoreError) -> Self {
        ServiceError::Failed {
            origin: FailureOrigin::Store,
            detail: err.to_string(),
        }
    }

    /// Stable machine-readable kind: `rejected`, `generation_timeout` or `failed`.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Rejected { .. } => "rejected",
            ServiceError::GenerationTimeout { .. } => "generation_timeout",
            ServiceError::Failed { .. } => "failed",
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Failure detail can carry store or provider internals, so only the
    /// origin is exposed for `Failed`.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Rejected { message, .. } => message.clone(),
            ServiceError::GenerationTimeout { after_secs } => {
                format!("generation did not finish within {after_secs}s; nothing was saved")
            }
            ServiceError::Failed { origin, .. } => match origin {
                FailureOrigin::Store => "the session store could not complete the request".into(),
                FailureOrigin::Provider => "the language model provider failed".into(),
                FailureOrigin::Internal => "internal error".into(),
            },
        }
    }
}

impl From<GenerationError> for ServiceError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Timeout { after } => ServiceError::GenerationTimeout {
                after_secs: after.as_secs(),
            },
            other => ServiceError::Failed {
                origin: FailureOrigin::Provider,
                detail: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn only_network_failures_are_connection_level() {
        assert!(ProviderError::Network("reset".into()).is_connection_level());
        assert!(ProviderError::StreamInterrupted("eof".into()).is_connection_level());
        assert!(!ProviderError::RateLimited { retry_after_secs: 1 }.is_connection_level());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_connection_level());
    }

    #[test]
    fn generation_timeout_maps_to_service_timeout() {
        let err: ServiceError = GenerationError::Timeout {
            after: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(err, ServiceError::GenerationTimeout { after_secs: 30 }));
        assert_eq!(err.kind(), "generation_timeout");
    }

    #[test]
    fn failed_public_message_hides_detail() {
        let err = ServiceError::store_failure(&StoreError::Unavailable(
            "pool timed out connecting to db-7.internal".into(),
        ));
        assert_eq!(err.kind(), "failed");
        assert!(!err.public_message().contains("db-7"));
        assert!(err.to_string().contains("db-7"));
    }
}
