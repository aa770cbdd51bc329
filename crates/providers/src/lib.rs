//! LLM provider implementations and the generation client for Turnstile.
//!
//! Providers implement the `turnstile_core::Provider` trait. The
//! [`GenerationClient`] wraps one with the timeout and retry policy.

pub mod client;
pub mod openai_compat;

pub use client::{GenerationClient, GenerationEvent, GenerationPolicy, GenerationStream};
pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;

use turnstile_config::AppConfig;
use turnstile_core::error::ProviderError;
use turnstile_core::provider::Provider;

/// Build the configured provider.
///
/// Every supported provider speaks the OpenAI chat-completions dialect, so
/// the configured name only labels logs and health output.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config
        .api_key
        .as_deref()
        .ok_or_else(|| ProviderError::NotConfigured("no API key configured".into()))?;
    let provider = OpenAiCompatProvider::new(
        config.provider.name.clone(),
        config.provider.base_url.clone(),
        api_key,
    )?;
    Ok(Arc::new(provider))
}

/// Build a generation client from configuration.
pub fn build_client(config: &AppConfig) -> Result<GenerationClient, ProviderError> {
    Ok(GenerationClient::new(
        build_provider(config)?,
        GenerationPolicy::from_config(&config.generation),
    ))
}
