//! Inbound request shape and validation.

use serde::{Deserialize, Serialize};
use turnstile_config::{GenerationConfig, SessionConfig};
use turnstile_core::error::{RejectKind, ServiceError};
use turnstile_core::generation::{FinishReason, GenerationParams};
use turnstile_core::session::{SessionId, TokenUsage};

/// Per-request generation overrides. Absent fields use configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A chat request: `{sessionId?, content, modelParams?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_params: Option<ModelParams>,
}

impl ChatRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            session_id: None,
            content: content.into(),
            model_params: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.model_params = Some(params);
        self
    }
}

/// A successful chat reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: String,
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
    /// Which model actually responded
    pub model: String,
    /// Session version after the commit
    pub version: u64,
    /// Partial output after a broken stream
    #[serde(default)]
    pub degraded: bool,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub session_id: Option<SessionId>,
    pub content: String,
    pub params: GenerationParams,
}

/// Parse a caller-supplied session id.
pub fn parse_session_id(raw: &str) -> Result<SessionId, ServiceError> {
    SessionId::parse(raw).map_err(|reason| ServiceError::rejected(RejectKind::InvalidInput, reason))
}

/// Check a model identifier against the allow-list.
pub fn check_model(model: &str, generation: &GenerationConfig) -> Result<(), ServiceError> {
    if generation.is_model_allowed(model) {
        Ok(())
    } else {
        Err(ServiceError::rejected(
            RejectKind::UnknownModel,
            format!("model {model:?} is not available"),
        ))
    }
}

/// Validate `request` and resolve its generation parameters.
pub fn validate_request(
    request: ChatRequest,
    generation: &GenerationConfig,
    session: &SessionConfig,
) -> Result<ValidatedRequest, ServiceError> {
    if request.content.trim().is_empty() {
        return Err(ServiceError::rejected(
            RejectKind::InvalidInput,
            "content must not be empty",
        ));
    }
    let chars = request.content.chars().count();
    if chars > session.max_content_chars {
        return Err(ServiceError::rejected(
            RejectKind::ContentTooLong,
            format!(
                "content is {chars} characters; the limit is {}",
                session.max_content_chars
            ),
        ));
    }

    let session_id = request
        .session_id
        .as_deref()
        .map(parse_session_id)
        .transpose()?;

    let overrides = request.model_params.unwrap_or_default();
    let mut params = GenerationParams::new(
        overrides
            .model
            .unwrap_or_else(|| generation.default_model.clone()),
    )
    .with_temperature(overrides.temperature.unwrap_or(generation.default_temperature));
    params.max_tokens = overrides.max_tokens.or(generation.default_max_tokens);

    params
        .validate()
        .map_err(|reason| ServiceError::rejected(RejectKind::InvalidInput, reason))?;
    if params
        .max_tokens
        .is_some_and(|max| max > generation.max_tokens_limit)
    {
        return Err(ServiceError::rejected(
            RejectKind::InvalidInput,
            format!("maxTokens must be at most {}", generation.max_tokens_limit),
        ));
    }
    check_model(&params.model, generation)?;

    Ok(ValidatedRequest {
        session_id,
        content: request.content,
        params,
    })
}
