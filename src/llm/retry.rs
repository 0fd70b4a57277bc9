//! Retry policy for completion calls.
//!
//! Local inference servers fail in characteristic ways: they answer with an
//! error status while busy, drop connections while a model is being
//! (re)loaded, and can take a very long time on slow hardware. Each failure
//! class gets its own wait before the next attempt:
//!
//! - Error status (and any other transport error): exponential backoff
//!   `base * 2^attempt`, capped at `status_backoff_cap`
//! - Connection failure: a fixed, longer wait (`connect_backoff`)
//! - Request timeout: retried immediately

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Default total number of attempts per completion call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Retry and timeout settings for the completion client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Base of the exponential backoff after an error status.
    pub status_backoff_base: Duration,
    /// Upper bound for the exponential backoff.
    pub status_backoff_cap: Duration,
    /// Wait after a refused or dropped connection.
    pub connect_backoff: Duration,
    /// Ceiling for a single streaming request.
    pub request_timeout: Duration,
    /// Timeout for the model-listing probe.
    pub probe_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status_backoff_base: Duration::from_secs(1),
            status_backoff_cap: Duration::from_secs(60),
            connect_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(2 * 60 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Failure classes that drive the backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Non-success status code, or any unclassified failure.
    Status,
    /// The service could not be reached.
    Connection,
    /// The request ran into the timeout ceiling.
    Timeout,
    /// A stop request was observed. Never retried.
    Cancelled,
}

impl FailureClass {
    /// Classifies a failed attempt.
    pub fn of(err: &LlmError) -> Self {
        match err {
            LlmError::Cancelled => FailureClass::Cancelled,
            LlmError::Connection(_) => FailureClass::Connection,
            LlmError::Timeout { .. } => FailureClass::Timeout,
            _ => FailureClass::Status,
        }
    }
}

impl RetryConfig {
    /// Set the total attempt count.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the request timeout ceiling.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set every backoff to the same duration. Mostly useful in tests.
    pub fn with_uniform_backoff(mut self, delay: Duration) -> Self {
        self.status_backoff_base = delay;
        self.status_backoff_cap = delay;
        self.connect_backoff = delay;
        self
    }

    /// Wait before the attempt following `attempt` (zero-based) failed.
    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Duration {
        match class {
            FailureClass::Status => {
                let factor = 2u32.saturating_pow(attempt);
                self.status_backoff_base
                    .saturating_mul(factor)
                    .min(self.status_backoff_cap)
            }
            FailureClass::Connection => self.connect_backoff,
            FailureClass::Timeout | FailureClass::Cancelled => Duration::ZERO,
        }
    }
}
