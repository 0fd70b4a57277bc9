//! Error types for discovery-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Completion service interactions (transport, status, streaming)
//! - Checkpoint and artifact persistence
//! - Pipeline configuration
//! - The run control surface

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the completion service.
///
/// Transport failures are retried by the client; callers only ever see
/// `Cancelled`, `RetriesExhausted` or the probe-level variants.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Connection to completion service failed: {0}")]
    Connection(String),

    #[error("Request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse completion service response: {0}")]
    ParseError(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Operation not supported by this provider: {0}")]
    Unsupported(String),

    #[error("All {attempts} attempts failed; last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl LlmError {
    /// Returns true when the error was produced by a stop request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }

    /// Classifies a reqwest error into the client's failure classes.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            LlmError::Timeout {
                seconds: timeout.as_secs(),
            }
        } else if err.is_connect() {
            LlmError::Connection(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

/// Errors that can occur while persisting checkpoints and run artifacts.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to create directory {path}: {reason}")]
    DirectoryCreationFailed { path: String, reason: String },

    #[error("Failed to persist {path}: {reason}")]
    PersistFailed { path: String, reason: String },

    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Background write task failed: {0}")]
    Join(String),
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Unknown stage role in a stage override file.
    #[error("Unknown stage role '{0}'")]
    UnknownStage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised synchronously by the run control surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("A discovery run is already active")]
    AlreadyRunning,

    #[error("No problem description provided")]
    EmptyProblem,

    #[error("No discovery run is active")]
    NotRunning,
}

/// Internal faults raised while executing a run.
///
/// These never escape a run: the orchestrator catches them once at the top,
/// logs them and finishes through the regular save routine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_messages() {
        let err = LlmError::ApiError {
            code: 503,
            message: "model loading".to_string(),
        };
        assert_eq!(err.to_string(), "API error (503): model loading");

        let err = LlmError::RetriesExhausted {
            attempts: 10,
            last_error: "boom".to_string(),
        };
        assert!(err.to_string().contains("All 10 attempts failed"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(LlmError::Cancelled.is_cancelled());
        assert!(!LlmError::Timeout { seconds: 1 }.is_cancelled());
    }

    #[test]
    fn test_control_error_messages() {
        assert_eq!(
            ControlError::AlreadyRunning.to_string(),
            "A discovery run is already active"
        );
        assert_eq!(
            ControlError::EmptyProblem.to_string(),
            "No problem description provided"
        );
    }

    #[test]
    fn test_pipeline_error_message() {
        let err = PipelineError::Panicked("index out of bounds".to_string());
        assert_eq!(err.to_string(), "Run panicked: index out of bounds");
    }
}
