//! discovery-forge: a staged, resumable discovery pipeline.
//!
//! This library drives a fixed sequence of completion calls against an
//! OpenAI-compatible inference server. It takes a frontier problem from target
//! selection through hypotheses, physics validation, engineering proposals and
//! requirement challenges to a synthesized thesis.

// Core modules
pub mod cli;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod utils;

// Re-export commonly used error types
pub use error::{CheckpointError, ConfigError, ControlError, LlmError, PipelineError};
