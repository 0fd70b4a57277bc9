//! Completion service integration.
//!
//! This module talks to an OpenAI-compatible inference server (LM Studio by
//! default). Completions are always streamed so a run can be stopped between
//! fragments; transient failures are retried according to [`RetryConfig`].
//!
//! ```ignore
//! use discovery_forge::llm::{CompletionProvider, CompletionRequest, LmStudioClient};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = LmStudioClient::local()?;
//! let request = CompletionRequest::new("gpt-oss-20b", "You are a physicist.", "Is cold fusion possible?")
//!     .with_temperature(0.2);
//! let text = client.complete(&request, &CancellationToken::new()).await?;
//! ```

pub mod client;
pub mod retry;
pub mod sse;

pub use client::{
    CompletionProvider, CompletionRequest, FragmentSink, LmStudioClient, Message, SamplingParams,
    DEFAULT_API_BASE, DEFAULT_API_KEY,
};
pub use retry::{FailureClass, RetryConfig, DEFAULT_MAX_ATTEMPTS};
