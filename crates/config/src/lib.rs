//! Configuration loading, validation, and management for Turnstile.
//!
//! Configuration is resolved once at startup: an optional TOML file, then
//! environment variable overrides, then validation. The resulting
//! [`AppConfig`] is immutable and handed explicitly to the store, the
//! generation client and the orchestrator.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "TURNSTILE_CONFIG";

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider credential. Never logged, never persisted with session data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Session store URL (`memory://`, `sqlite:...`, `postgres://...`, `mongodb://...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,

    /// LLM provider endpoint
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Generation defaults and retry policy
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Session handling and request limits
    #[serde(default)]
    pub session: SessionConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

/// Keep only the scheme of a URL; the rest may carry credentials.
pub fn redact_url(url: &str) -> String {
    match url.split_once(':') {
        Some((scheme, _)) => format!("{scheme}:[REDACTED]"),
        None => "[REDACTED]".into(),
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("store_url", &self.store_url.as_deref().map(redact_url))
            .field("provider", &self.provider)
            .field("generation", &self.generation)
            .field("session", &self.session)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name used in logs and health output
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_provider_url")]
    pub base_url: String,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_provider_url() -> String {
    "https://api.openai.com/v1".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_provider_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Model used when the request does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Models callers may request. The default model is always allowed.
    #[serde(default = "default_allowed_models")]
    pub allowed_models: Vec<String>,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per response (unset = provider default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_tokens: Option<u32>,

    /// Upper bound a caller may request for max tokens
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: u32,

    /// Hard wall-clock limit per generation call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts for connection-level failures (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_allowed_models() -> Vec<String> {
    vec![
        "gpt-4o-mini".into(),
        "gpt-4o".into(),
        "gpt-4-1106-preview".into(),
    ]
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens_limit() -> u32 {
    4096
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    2
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    4_000
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            allowed_models: default_allowed_models(),
            default_temperature: default_temperature(),
            default_max_tokens: None,
            max_tokens_limit: default_max_tokens_limit(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl GenerationConfig {
    /// Whether `model` may be requested.
    pub fn is_model_allowed(&self, model: &str) -> bool {
        model == self.default_model || self.allowed_models.iter().any(|m| m == model)
    }
}

/// How much prior conversation is handed to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ContextWindowConfig {
    /// Keep the most recent `max_turns` turns
    LastTurns { max_turns: usize },
    /// Keep the most recent turns fitting in `max_tokens` (estimated)
    TokenBudget { max_tokens: usize },
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        ContextWindowConfig::LastTurns { max_turns: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Create unknown session ids on first use
    #[serde(default = "default_true")]
    pub allow_create: bool,

    /// Longest accepted user content, in characters
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    #[serde(default)]
    pub context_window: ContextWindowConfig,

    /// Instructions prepended to every provider call (not stored)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Store the assistant turn of a filtered generation
    #[serde(default = "default_true")]
    pub persist_filtered: bool,
}

fn default_true() -> bool {
    true
}
fn default_max_content_chars() -> usize {
    32_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_create: true,
            max_content_chars: default_max_content_chars(),
            context_window: ContextWindowConfig::default(),
            system_prompt: None,
            persist_filtered: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Allow any origin, method and header
    #[serde(default = "default_true")]
    pub cors_permissive: bool,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_permissive: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl AppConfig {
    /// Load configuration for this process.
    ///
    /// File resolution: `path` argument, then `TURNSTILE_CONFIG`, else defaults.
    /// Environment overrides (highest priority):
    /// - `TURNSTILE_API_KEY`, then `OPENAI_API_KEY`
    /// - `TURNSTILE_STORE_URL`, then `DATABASE_URL`
    /// - `TURNSTILE_PROVIDER_URL`, `TURNSTILE_MODEL`, `TURNSTILE_PORT`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::load_from(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("TURNSTILE_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(url) = non_empty("TURNSTILE_STORE_URL")
            .or_else(|| non_empty("DATABASE_URL"))
            .or_else(|| non_empty("MONGODB_URL"))
        {
            self.store_url = Some(url);
        }
        if let Some(url) = non_empty("TURNSTILE_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = non_empty("TURNSTILE_MODEL") {
            self.generation.default_model = model;
        }
        if let Some(port) = non_empty("TURNSTILE_PORT") {
            self.gateway.port = port.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("TURNSTILE_PORT is not a valid port: {port}"))
            })?;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.default_temperature) {
            return Err(ConfigError::ValidationError(
                "generation.default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if generation.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "generation.default_model must not be empty".into(),
            ));
        }
        if generation.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "generation.timeout_secs must be > 0".into(),
            ));
        }
        if generation.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "generation.max_attempts must be >= 1".into(),
            ));
        }
        if generation.max_tokens_limit == 0 {
            return Err(ConfigError::ValidationError(
                "generation.max_tokens_limit must be > 0".into(),
            ));
        }
        if let Some(max) = generation.default_max_tokens {
            if max == 0 || max > generation.max_tokens_limit {
                return Err(ConfigError::ValidationError(
                    "generation.default_max_tokens must be within 1..=max_tokens_limit".into(),
                ));
            }
        }
        if self.session.max_content_chars == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_content_chars must be > 0".into(),
            ));
        }
        match self.session.context_window {
            ContextWindowConfig::LastTurns { max_turns: 0 }
            | ContextWindowConfig::TokenBudget { max_tokens: 0 } => {
                return Err(ConfigError::ValidationError(
                    "session.context_window limit must be > 0".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Check the settings the server cannot start without.
    ///
    /// A missing credential or store URL is a startup error, never a
    /// per-request one.
    pub fn require_serving(&self) -> Result<(), ConfigError> {
        if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(ConfigError::Missing(
                "provider API key (set OPENAI_API_KEY or TURNSTILE_API_KEY)".into(),
            ));
        }
        if self.store_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
            return Err(ConfigError::Missing(
                "session store URL (set TURNSTILE_STORE_URL, DATABASE_URL or MONGODB_URL)".into(),
            ));
        }
        Ok(())
    }

    /// Effective configuration as TOML with secrets redacted.
    pub fn redacted_toml(&self) -> String {
        let mut shown = self.clone();
        shown.api_key = shown.api_key.as_ref().map(|_| "[REDACTED]".into());
        shown.store_url = shown.store_url.as_deref().map(redact_url);
        toml::to_string_pretty(&shown).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            store_url: None,
            provider: ProviderConfig::default(),
            generation: GenerationConfig::default(),
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required setting: {0}")]
    Missing(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.generation.timeout_secs, 30);
        assert_eq!(config.generation.max_attempts, 2);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.generation.default_model, config.generation.default_model);
        assert_eq!(parsed.session.context_window, config.session.context_window);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.generation.default_temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_context_window_rejected() {
        let mut config = AppConfig::default();
        config.session.context_window = ContextWindowConfig::TokenBudget { max_tokens: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/turnstile.toml")).unwrap();
        assert_eq!(config.gateway.port, 8000);
    }

    #[test]
    fn load_from_file_with_token_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turnstile.toml");
        std::fs::write(
            &path,
            r#"
store_url = "sqlite://sessions.db"

[generation]
default_model = "gpt-4o"
timeout_secs = 10

[session.context_window]
strategy = "token_budget"
max_tokens = 2000
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.generation.default_model, "gpt-4o");
        assert_eq!(config.generation.timeout_secs, 10);
        assert_eq!(
            config.session.context_window,
            ContextWindowConfig::TokenBudget { max_tokens: 2000 }
        );
        assert_eq!(config.store_url.as_deref(), Some("sqlite://sessions.db"));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "gateway = 12").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_take_priority() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("OPENAI_API_KEY", "sk-openai"),
                ("TURNSTILE_API_KEY", "sk-turnstile"),
                ("DATABASE_URL", "postgres://u:p@db/chat"),
                ("TURNSTILE_MODEL", "gpt-4o"),
                ("TURNSTILE_PORT", "9001"),
            ]))
            .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-turnstile"));
        assert_eq!(config.store_url.as_deref(), Some("postgres://u:p@db/chat"));
        assert_eq!(config.generation.default_model, "gpt-4o");
        assert_eq!(config.gateway.port, 9001);
    }

    #[test]
    fn mongodb_url_alone_configures_the_store() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("OPENAI_API_KEY", "sk-openai"),
                ("MONGODB_URL", "mongodb://mongo:27017"),
            ]))
            .unwrap();
        assert_eq!(config.store_url.as_deref(), Some("mongodb://mongo:27017"));
        assert!(config.require_serving().is_ok());
    }

    #[test]
    fn database_url_wins_over_mongodb_url() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("MONGODB_URL", "mongodb://mongo:27017"),
                ("DATABASE_URL", "sqlite://sessions.db"),
            ]))
            .unwrap();
        assert_eq!(config.store_url.as_deref(), Some("sqlite://sessions.db"));
    }

    #[test]
    fn bad_port_env_is_rejected() {
        let mut config = AppConfig::default();
        assert!(config.apply_env(env(&[("TURNSTILE_PORT", "eighty")])).is_err());
    }

    #[test]
    fn serving_requires_key_and_store() {
        let mut config = AppConfig::default();
        assert!(matches!(config.require_serving(), Err(ConfigError::Missing(_))));

        config.api_key = Some("sk-test".into());
        let err = config.require_serving().unwrap_err();
        assert!(err.to_string().contains("store URL"));
        assert!(err.to_string().contains("MONGODB_URL"));

        config.store_url = Some("memory://".into());
        assert!(config.require_serving().is_ok());
    }

    #[test]
    fn debug_and_toml_redact_secrets() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-very-secret".into());
        config.store_url = Some("postgres://admin:hunter2@db/chat".into());

        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(!debug.contains("hunter2"));

        let shown = config.redacted_toml();
        assert!(!shown.contains("sk-very-secret"));
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("postgres:[REDACTED]"));
    }

    #[test]
    fn default_model_is_always_allowed() {
        let mut generation = GenerationConfig::default();
        generation.allowed_models.clear();
        assert!(generation.is_model_allowed("gpt-4o-mini"));
        assert!(!generation.is_model_allowed("gpt-5-ultra"));
    }
}
