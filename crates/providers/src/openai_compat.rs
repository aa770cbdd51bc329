//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions`. Supports non-streaming and streaming (SSE) chat
//! completions, model listing and health checks.
//!
//! Provider-side content rejections (finish reason `content_filter`, or an
//! HTTP 400 carrying a content-policy error code) come back as responses with
//! [`FinishReason::Filtered`], not as errors.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use turnstile_core::error::ProviderError;
use turnstile_core::generation::FinishReason;
use turnstile_core::provider::*;
use turnstile_core::session::{TokenUsage, Turn};

/// Error codes that mean the provider refused the content.
const FILTER_CODES: &[&str] = &["content_filter", "content_policy_violation"];

/// Retry-After fallback when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// No overall request timeout is set on the HTTP client; the generation
    /// client owns the wall-clock budget.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn to_api_messages(messages: &[Turn]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn post_chat(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(request, stream));
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.without_url().to_string()))
    }
}

/// Outcome of a non-2xx reply.
#[derive(Debug)]
enum Rejection {
    /// The provider refused the content; report as a filtered result.
    Filtered,
    Error(ProviderError),
}

async fn classify_failure(response: reqwest::Response) -> Rejection {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    classify_status(status, retry_after, &body)
}

fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> Rejection {
    match status {
        429 => Rejection::Error(ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        }),
        401 | 403 => Rejection::Error(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        _ => {
            let parsed = serde_json::from_str::<ApiErrorEnvelope>(body).ok();
            let code = parsed.as_ref().and_then(|p| p.error.code.as_deref());
            if status == 400 && code.is_some_and(|c| FILTER_CODES.contains(&c)) {
                return Rejection::Filtered;
            }
            if status == 404 && code == Some("model_not_found") {
                let message = parsed.map(|p| p.error.message).unwrap_or_default();
                return Rejection::Error(ProviderError::ModelNotFound(message));
            }
            warn!(status, "Provider returned error");
            let message = parsed
                .map(|p| p.error.message)
                .unwrap_or_else(|| body.chars().take(512).collect());
            Rejection::Error(ProviderError::ApiError {
                status_code: status,
                message,
            })
        }
    }
}

fn filtered_response(model: &str) -> ProviderResponse {
    ProviderResponse {
        content: String::new(),
        usage: None,
        model: model.to_string(),
        finish_reason: FinishReason::Filtered,
    }
}

#[async_trait]
impl turnstile_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post_chat(&request, false).await?;
        if !response.status().is_success() {
            return match classify_failure(response).await {
                Rejection::Filtered => Ok(filtered_response(&request.model)),
                Rejection::Error(e) => Err(e),
            };
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                })?;

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: api_response.usage.map(ApiUsage::into_usage),
            model: api_response.model,
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::from_provider)
                .unwrap_or(FinishReason::Completed),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post_chat(&request, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        if !response.status().is_success() {
            return match classify_failure(response).await {
                Rejection::Filtered => {
                    let filtered = filtered_response(&request.model);
                    let _ = tx
                        .send(Ok(StreamChunk {
                            done: true,
                            finish_reason: Some(filtered.finish_reason),
                            model: Some(filtered.model),
                            ..StreamChunk::default()
                        }))
                        .await;
                    Ok(rx)
                }
                Rejection::Error(e) => Err(e),
            };
        }

        let provider_name = self.name.clone();

        // Read the SSE byte stream; the task ends when the receiver is dropped.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for chunk in decoder.feed(&bytes, &provider_name) {
                    let done = chunk.done;
                    if tx.send(Ok(chunk)).await.is_err() || done {
                        return;
                    }
                }
            }

            let _ = tx.send(decoder.finish()).await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let models = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.without_url().to_string()))?;

        Ok(response.status().is_success())
    }
}

// --- SSE decoding ---

/// Incremental decoder for an OpenAI chat-completions SSE body.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network reads survive intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    model: Option<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the chunks completed so far. A chunk with
    /// `done = true` is always the last one produced.
    fn feed(&mut self, bytes: &[u8], provider: &str) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            // Skip blank separators and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                out.push(self.final_chunk());
                return out;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(resp) => {
                    if let Some(model) = resp.model {
                        self.model = Some(model);
                    }
                    if let Some(usage) = resp.usage {
                        self.usage = Some(usage.into_usage());
                    }
                    if let Some(choice) = resp.choices.into_iter().next() {
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            self.finish_reason = Some(FinishReason::from_provider(reason));
                        }
                        if let Some(text) = choice.delta.content.filter(|c| !c.is_empty()) {
                            out.push(StreamChunk {
                                content: Some(text),
                                ..StreamChunk::default()
                            });
                        }
                    }
                }
                Err(e) => {
                    trace!(provider = %provider, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }
        out
    }

    /// Called when the body ends without `[DONE]`.
    ///
    /// A body that reported a finish reason is complete; anything else was
    /// cut off.
    fn finish(self) -> Result<StreamChunk, ProviderError> {
        if self.finish_reason.is_some() {
            Ok(self.final_chunk())
        } else {
            Err(ProviderError::StreamInterrupted(
                "stream ended before the provider reported completion".into(),
            ))
        }
    }

    fn final_chunk(&self) -> StreamChunk {
        StreamChunk {
            content: None,
            done: true,
            usage: self.usage,
            finish_reason: Some(self.finish_reason.unwrap_or(FinishReason::Completed)),
            model: self.model.clone(),
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl ApiUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::Provider;

    #[test]
    fn named_constructor() {
        let provider =
            OpenAiCompatProvider::new("openai", "https://api.openai.com/v1", "sk-test").unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn trailing_slash_trimmed() {
        let provider =
            OpenAiCompatProvider::new("ollama", "http://localhost:11434/v1/", "ollama").unwrap();
        assert_eq!(provider.base_url(), "http://localhost:11434/v1");
    }

    #[test]
    fn debug_redacts_api_key() {
        let provider =
            OpenAiCompatProvider::new("openai", "https://api.openai.com/v1", "sk-very-secret")
                .unwrap();
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Turn::system("You are helpful"), Turn::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn streaming_body_requests_usage() {
        let request = ProviderRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![Turn::user("hi")],
            temperature: 0.2,
            max_tokens: Some(16),
        };
        let body = OpenAiCompatProvider::request_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 16);

        let body = OpenAiCompatProvider::request_body(&request, false);
        assert!(body.get("stream_options").is_none());
    }

    // --- Status classification ---

    #[test]
    fn content_policy_400_is_filtered() {
        let body = r#"{"error":{"message":"flagged","type":"invalid_request_error","code":"content_policy_violation"}}"#;
        assert!(matches!(classify_status(400, None, body), Rejection::Filtered));
    }

    #[test]
    fn plain_400_is_api_error() {
        let body = r#"{"error":{"message":"bad temperature","code":null}}"#;
        match classify_status(400, None, body) {
            Rejection::Error(ProviderError::ApiError { status_code, message }) => {
                assert_eq!(status_code, 400);
                assert_eq!(message, "bad temperature");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rate_limit_uses_retry_after() {
        assert!(matches!(
            classify_status(429, Some(12), ""),
            Rejection::Error(ProviderError::RateLimited { retry_after_secs: 12 })
        ));
        assert!(matches!(
            classify_status(429, None, ""),
            Rejection::Error(ProviderError::RateLimited { retry_after_secs: DEFAULT_RETRY_AFTER_SECS })
        ));
    }

    #[test]
    fn auth_failures_never_echo_body() {
        match classify_status(401, None, "key sk-abc is invalid") {
            Rejection::Error(ProviderError::AuthenticationFailed(msg)) => {
                assert!(!msg.contains("sk-abc"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_model_404() {
        let body = r#"{"error":{"message":"The model `gpt-9` does not exist","code":"model_not_found"}}"#;
        assert!(matches!(
            classify_status(404, None, body),
            Rejection::Error(ProviderError::ModelNotFound(_))
        ));
    }

    // --- SSE decoding ---

    #[test]
    fn decodes_content_then_done() {
        let mut decoder = SseDecoder::default();
        let body = concat!(
            "data: {\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = decoder.feed(body.as_bytes(), "test");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].content.as_deref(), Some("lo"));

        let last = &chunks[2];
        assert!(last.done);
        assert_eq!(last.finish_reason, Some(FinishReason::Completed));
        assert_eq!(last.usage.map(|u| u.total_tokens), Some(6));
        assert_eq!(last.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn split_multibyte_character_survives() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n";
        let bytes = line.as_bytes();
        // Split inside the two-byte 'é'
        let split = line.find('\u{e9}').unwrap() + 1;
        assert!(decoder.feed(&bytes[..split], "test").is_empty());
        let chunks = decoder.feed(&bytes[split..], "test");
        assert_eq!(chunks[0].content.as_deref(), Some("caf\u{e9}"));
    }

    #[test]
    fn content_filter_finish_reason_maps_to_filtered() {
        let mut decoder = SseDecoder::default();
        let body = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"content_filter\"}]}\n\ndata: [DONE]\n\n";
        let chunks = decoder.feed(body.as_bytes(), "test");
        assert_eq!(chunks.last().unwrap().finish_reason, Some(FinishReason::Filtered));
    }

    #[test]
    fn body_ending_without_finish_is_interrupted() {
        let mut decoder = SseDecoder::default();
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n";
        assert_eq!(decoder.feed(body.as_bytes(), "test").len(), 1);
        assert!(matches!(
            decoder.finish(),
            Err(ProviderError::StreamInterrupted(_))
        ));
    }

    #[test]
    fn body_ending_after_finish_reason_is_complete() {
        let mut decoder = SseDecoder::default();
        let body = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n\n";
        assert!(decoder.feed(body.as_bytes(), "test").is_empty());
        let last = decoder.finish().unwrap();
        assert!(last.done);
        assert_eq!(last.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn comments_and_garbage_are_skipped() {
        let mut decoder = SseDecoder::default();
        let body = ": keep-alive\n\ndata: not-json\n\nevent: ping\n";
        assert!(decoder.feed(body.as_bytes(), "test").is_empty());
    }
}
