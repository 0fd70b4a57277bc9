//! Streaming client for OpenAI-compatible local inference servers.
//!
//! Every completion is requested with `stream: true` so that a stop request
//! can abort a long generation between fragments instead of waiting for the
//! whole response.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{FailureClass, RetryConfig};
use super::sse::{self, SseLine};
use crate::error::LlmError;

/// Default endpoint of a local LM Studio server.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:1234/v1";

/// Placeholder key accepted by LM Studio.
pub const DEFAULT_API_KEY: &str = "lm-studio";

/// A message in a conversation with the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system" or "user").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f64,
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Nucleus sampling parameter (0.0 - 1.0).
    pub top_p: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 0.9,
        }
    }
}

/// One completion call: a system instruction, a user message and the model
/// parameters to use.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier to use for generation.
    pub model: String,
    /// System message followed by the user message.
    pub messages: Vec<Message>,
    /// Sampling parameters.
    pub params: SamplingParams,
}

impl CompletionRequest {
    /// Create a request from a system instruction and a user message.
    pub fn new(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::system(system), Message::user(user)],
            params: SamplingParams::default(),
        }
    }

    /// Set all sampling parameters.
    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Set the temperature for this request.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = temperature;
        self
    }

    /// Set the max tokens for this request.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = max_tokens;
        self
    }

    /// Set the top_p for this request.
    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.params.top_p = top_p;
        self
    }

    /// Content of the system message.
    pub fn system_text(&self) -> &str {
        self.message_text("system")
    }

    /// Content of the user message.
    pub fn user_text(&self) -> &str {
        self.message_text("user")
    }

    fn message_text(&self, role: &str) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == role)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Callback that receives each decoded text fragment as it arrives.
pub type FragmentSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Trait for services that can complete a prompt.
///
/// `complete` returns the full accumulated text. It fails with
/// [`LlmError::Cancelled`] when `cancel` fires before or during the call, and
/// with [`LlmError::RetriesExhausted`] once the retry budget is spent.
/// Partial output is never returned.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run one completion call.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError>;

    /// Run one completion call, handing every fragment to `on_fragment` in
    /// arrival order.
    ///
    /// Fragments of an attempt that later fails are not retracted. Providers
    /// without a stream deliver the whole text as a single fragment.
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        on_fragment: &FragmentSink<'_>,
    ) -> Result<String, LlmError> {
        let text = self.complete(request, cancel).await?;
        on_fragment(&text);
        Ok(text)
    }

    /// List the model identifiers the service currently offers.
    ///
    /// Providers that cannot probe their backend report
    /// [`LlmError::Unsupported`].
    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Err(LlmError::Unsupported("model listing".to_string()))
    }
}

/// Client for LM Studio and other OpenAI-compatible servers.
pub struct LmStudioClient {
    /// Base URL for the API, e.g. `http://127.0.0.1:1234/v1`.
    api_base: String,
    /// Bearer token sent with every request.
    api_key: String,
    /// Retry and timeout policy.
    retry: RetryConfig,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl LmStudioClient {
    /// Create a client with an explicit endpoint and retry policy.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(retry.request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry,
            http_client,
        })
    }

    /// Create a client for the default local endpoint.
    pub fn local() -> Result<Self, LlmError> {
        Self::new(DEFAULT_API_BASE, DEFAULT_API_KEY, RetryConfig::default())
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Get the retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the first model the server reports, if any.
    pub async fn loaded_model(&self) -> Option<String> {
        self.fetch_models().await.ok()?.into_iter().next()
    }

    async fn fetch_models(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/models", self.api_base);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.retry.probe_timeout)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(e, self.retry.probe_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let body: ModelsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        Ok(body
            .data
            .into_iter()
            .map(|m| m.id.unwrap_or_else(|| "unknown".to_string()))
            .collect())
    }

    /// Runs a single streaming attempt and accumulates its fragments.
    async fn stream_once(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        on_fragment: &FragmentSink<'_>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatCompletionBody {
            model: &request.model,
            messages: &request.messages,
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
            top_p: request.params.top_p,
            stream: true,
        };

        let send = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = send => result.map_err(|e| LlmError::from_reqwest(e, self.retry.request_timeout))?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let mut stream = response.bytes_stream();
        let mut lines = sse::LineBuffer::new();
        let mut content = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                next = stream.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        seconds: self.retry.request_timeout.as_secs(),
                    }
                } else {
                    LlmError::Stream(e.to_string())
                }
            })?;

            for line in lines.push(&chunk) {
                match line {
                    SseLine::Delta(text) => {
                        on_fragment(&text);
                        content.push_str(&text);
                    }
                    SseLine::Done => return Ok(content),
                    SseLine::Ignored => {}
                }
            }

            if lines.overflowed() {
                return Err(LlmError::Stream(
                    "Stream line exceeded maximum buffer size".to_string(),
                ));
            }

            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
        }

        // Connection closed without a sentinel; decode any unterminated tail.
        if let SseLine::Delta(text) = lines.finish() {
            on_fragment(&text);
            content.push_str(&text);
        }

        Ok(content)
    }
}

#[async_trait]
impl CompletionProvider for LmStudioClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        self.complete_streaming(request, cancel, &|_| {}).await
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        on_fragment: &FragmentSink<'_>,
    ) -> Result<String, LlmError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                info!(model = %request.model, "Stop requested before completion call");
                return Err(LlmError::Cancelled);
            }

            debug!(
                model = %request.model,
                attempt = attempt + 1,
                max_attempts,
                "Calling model"
            );

            let err = match self.stream_once(request, cancel, on_fragment).await {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            let class = FailureClass::of(&err);
            if class == FailureClass::Cancelled {
                info!(model = %request.model, "Completion call interrupted by stop request");
                return Err(err);
            }

            last_error = err.to_string();
            if attempt + 1 >= max_attempts {
                break;
            }

            let delay = self.retry.delay_for(class, attempt);
            warn!(
                model = %request.model,
                attempt = attempt + 1,
                max_attempts,
                failure = ?class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Completion attempt failed, retrying"
            );

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        error!(
            model = %request.model,
            attempts = max_attempts,
            error = %last_error,
            "All completion attempts failed"
        );
        Err(LlmError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let models = self.fetch_models().await?;
        info!(count = models.len(), "Connected to completion service");
        Ok(models)
    }
}

/// Wire format of a streaming chat completion request.
#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    stream: bool,
}

/// Response of the models endpoint.
#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: Option<String>,
}
