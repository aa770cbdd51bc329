//! Generation client: timeout, retry and streaming on top of a [`Provider`].
//!
//! Every call consumes the provider's chunk stream. [`GenerationClient::invoke`]
//! accumulates it into one [`GenerationResult`]; [`GenerationClient::stream`]
//! forwards each delta as it arrives and ends with exactly one
//! [`GenerationEvent::Finished`].
//!
//! Retries are only attempted for connection-level failures that happen
//! before the first token. Once output has been received a broken stream
//! yields the partial text tagged [`FinishReason::Interrupted`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turnstile_config::GenerationConfig;
use turnstile_core::error::{GenerationError, ProviderError};
use turnstile_core::generation::{FinishReason, GenerationRequest, GenerationResult};
use turnstile_core::provider::{Provider, ProviderRequest};
use turnstile_core::session::TokenUsage;

/// Upper bound of the random extra delay, as a fraction of the backoff.
const JITTER_FRACTION: f64 = 0.1;

/// Timeout and retry knobs for a [`GenerationClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPolicy {
    /// Wall-clock budget for a whole call, retries and backoff included
    pub timeout: Duration,
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

impl GenerationPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Base delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn backoff_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        let extra = rand::rng().random_range(0.0..=JITTER_FRACTION);
        base.mul_f64(1.0 + extra)
    }
}

/// One item of a [`GenerationStream`].
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A piece of generated text
    Delta(String),
    /// The terminal outcome; nothing follows it
    Finished(Result<GenerationResult, GenerationError>),
}

/// Calls a provider under a [`GenerationPolicy`].
#[derive(Clone)]
pub struct GenerationClient {
    provider: Arc<dyn Provider>,
    policy: GenerationPolicy,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn Provider>, policy: GenerationPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Run a generation to completion and return the accumulated result.
    ///
    /// Dropping the returned future cancels the provider call.
    pub async fn invoke(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        run_with_timeout(
            Arc::clone(&self.provider),
            self.policy.clone(),
            ProviderRequest::from(request),
            None,
        )
        .await
    }

    /// Start a generation and expose it as a lazy, finite event sequence.
    ///
    /// The work runs on its own task; dropping the stream aborts it.
    pub fn stream(&self, request: &GenerationRequest) -> GenerationStream {
        let (tx, rx) = mpsc::channel(64);
        let provider = Arc::clone(&self.provider);
        let policy = self.policy.clone();
        let wire = ProviderRequest::from(request);

        let task = tokio::spawn(async move {
            let outcome = run_with_timeout(provider, policy, wire, Some(tx.clone())).await;
            let _ = tx.send(GenerationEvent::Finished(outcome)).await;
        });

        GenerationStream {
            rx,
            task,
            finished: false,
        }
    }
}

/// Streaming handle returned by [`GenerationClient::stream`].
///
/// Yields zero or more [`GenerationEvent::Delta`]s, then exactly one
/// [`GenerationEvent::Finished`], then `None` forever.
pub struct GenerationStream {
    rx: mpsc::Receiver<GenerationEvent>,
    task: JoinHandle<()>,
    finished: bool,
}

impl GenerationStream {
    /// Next event, or `None` once the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Drain the stream, discarding deltas, and return the outcome.
    pub async fn into_result(mut self) -> Result<GenerationResult, GenerationError> {
        while let Some(event) = self.next_event().await {
            if let GenerationEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        Err(GenerationError::Aborted("generation task ended without an outcome".into()))
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<GenerationEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, GenerationEvent::Finished(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // The worker died without reporting; surface it once.
                self.finished = true;
                Poll::Ready(Some(GenerationEvent::Finished(Err(GenerationError::Aborted(
                    "generation task ended without an outcome".into(),
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl futures::Stream for GenerationStream {
    type Item = GenerationEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// --- Internals ---

async fn run_with_timeout(
    provider: Arc<dyn Provider>,
    policy: GenerationPolicy,
    request: ProviderRequest,
    sink: Option<mpsc::Sender<GenerationEvent>>,
) -> Result<GenerationResult, GenerationError> {
    let budget = policy.timeout;
    match tokio::time::timeout(budget, run_attempts(provider, &policy, request, sink)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(timeout_secs = budget.as_secs(), "Generation timed out");
            Err(GenerationError::Timeout { after: budget })
        }
    }
}

/// How one attempt ended.
enum Attempt {
    Done(GenerationResult),
    /// Nothing was received; the failure may or may not be retryable
    FailedEarly(ProviderError),
}

async fn run_attempts(
    provider: Arc<dyn Provider>,
    policy: &GenerationPolicy,
    request: ProviderRequest,
    sink: Option<mpsc::Sender<GenerationEvent>>,
) -> Result<GenerationResult, GenerationError> {
    let mut attempt = 1;
    loop {
        debug!(provider = provider.name(), attempt, "Starting generation attempt");

        let error = match single_attempt(provider.as_ref(), &request, sink.as_ref()).await {
            Attempt::Done(result) => return Ok(result),
            Attempt::FailedEarly(error) => error,
        };

        if !error.is_connection_level() {
            return Err(GenerationError::Provider(error));
        }
        if attempt >= policy.max_attempts {
            return Err(GenerationError::RetriesExhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.backoff_with_jitter(attempt);
        info!(
            provider = provider.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Connection-level failure before first token, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn single_attempt(
    provider: &dyn Provider,
    request: &ProviderRequest,
    sink: Option<&mpsc::Sender<GenerationEvent>>,
) -> Attempt {
    let mut rx = match provider.stream(request.clone()).await {
        Ok(rx) => rx,
        Err(e) => return Attempt::FailedEarly(e),
    };

    let mut content = String::new();
    let mut usage: Option<TokenUsage> = None;
    let mut model = request.model.clone();

    loop {
        match rx.recv().await {
            Some(Ok(chunk)) => {
                if let Some(m) = chunk.model {
                    model = m;
                }
                if chunk.usage.is_some() {
                    usage = chunk.usage;
                }
                if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
                    content.push_str(&text);
                    if let Some(sink) = sink {
                        // A vanished consumer does not stop accumulation.
                        let _ = sink.send(GenerationEvent::Delta(text)).await;
                    }
                }
                if chunk.done {
                    return Attempt::Done(GenerationResult {
                        content,
                        usage,
                        finish_reason: chunk.finish_reason.unwrap_or(FinishReason::Completed),
                        model,
                    });
                }
            }
            Some(Err(e)) if content.is_empty() => return Attempt::FailedEarly(e),
            None if content.is_empty() => {
                return Attempt::FailedEarly(ProviderError::StreamInterrupted(
                    "stream closed before any output".into(),
                ));
            }
            Some(Err(e)) => {
                warn!(error = %e, received = content.len(), "Stream broke after partial output");
                return Attempt::Done(interrupted(content, usage, model));
            }
            None => {
                warn!(received = content.len(), "Stream closed without completion");
                return Attempt::Done(interrupted(content, usage, model));
            }
        }
    }
}

fn interrupted(content: String, usage: Option<TokenUsage>, model: String) -> GenerationResult {
    GenerationResult {
        content,
        usage,
        finish_reason: FinishReason::Interrupted,
        model,
    }
}
