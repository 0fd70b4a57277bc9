//! Shared utility functions for discovery-forge.
//!
//! This module provides common utilities used across multiple modules,
//! including structured-output recovery from model responses and text
//! truncation for prompt digests.

pub mod json_extraction;

pub use json_extraction::{
    extract_bracketed, extract_fenced_block, parse_model_output, value_text, ParsedOutput,
    RAW_TEXT_FIELD,
};

/// Returns at most `max_chars` characters of `text`.
///
/// Counts characters rather than bytes so multi-byte text is never split.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
