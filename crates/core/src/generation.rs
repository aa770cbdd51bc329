//! Generation request/result types.
//!
//! [`GenerationParams`] is the named, validated option set a caller may
//! tune per request; [`GenerationRequest`] bundles it with the bounded
//! context and the new input; [`GenerationResult`] is what comes back.

use serde::{Deserialize, Serialize};

use crate::session::{TokenUsage, Turn};

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model finished naturally
    Completed,
    /// The output hit the token limit
    Length,
    /// The provider rejected or suppressed the content
    Filtered,
    /// The provider reported an error for this generation
    Error,
    /// The stream broke after partial output was received
    Interrupted,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Completed => "completed",
            FinishReason::Length => "length",
            FinishReason::Filtered => "filtered",
            FinishReason::Error => "error",
            FinishReason::Interrupted => "interrupted",
        }
    }

    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "stop" | "tool_calls" | "function_call" | "end_turn" => FinishReason::Completed,
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" => FinishReason::Filtered,
            _ => FinishReason::Error,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request generation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// Temperature (0.0 = deterministic, 2.0 = maximum)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Check the option ranges. Model allow-listing is the orchestrator's job.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model must not be empty".into());
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be between 0.0 and 2.0".into());
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be at least 1".into());
        }
        Ok(())
    }
}

/// A single generation call: bounded context plus the new user input.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Optional instructions placed before the context
    pub system_prompt: Option<String>,

    /// The context window, oldest first
    pub context: Vec<Turn>,

    /// The new user input
    pub input: String,

    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(context: Vec<Turn>, input: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            system_prompt: None,
            context,
            input: input.into(),
            params,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// The full message list sent to the provider.
    pub fn messages(&self) -> Vec<Turn> {
        let mut messages = Vec::with_capacity(self.context.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Turn::system(prompt.clone()));
        }
        messages.extend(self.context.iter().cloned());
        messages.push(Turn::user(self.input.clone()));
        messages
    }
}

/// The outcome of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generated text (possibly partial when interrupted)
    pub content: String,

    /// Token usage, if the provider reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    pub finish_reason: FinishReason,

    /// Which model actually responded
    pub model: String,
}

impl GenerationResult {
    /// Partial output returned after the stream broke.
    pub fn is_degraded(&self) -> bool {
        self.finish_reason == FinishReason::Interrupted
    }
}
