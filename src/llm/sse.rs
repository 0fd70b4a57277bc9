//! Server-sent event decoding for streamed chat completions.
//!
//! The completion service emits one `data: {json}` line per token batch and a
//! final `data: [DONE]` sentinel. Bytes arrive in arbitrary chunks, so lines
//! are buffered until complete before they are decoded.

use serde_json::Value;

/// End-of-stream sentinel.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Upper bound on buffered, not yet terminated bytes.
pub const MAX_LINE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// One decoded stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A non-empty content fragment.
    Delta(String),
    /// The end-of-stream sentinel.
    Done,
    /// Comments, keep-alives, role-only deltas and undecodable frames.
    Ignored,
}

/// Buffers raw stream bytes and decodes them line by line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and decodes every line it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line) = drain_next_line(&mut self.pending) {
            lines.push(decode_line(&String::from_utf8_lossy(&line)));
        }
        lines
    }

    /// True once the unterminated tail exceeds [`MAX_LINE_BUFFER_BYTES`].
    pub fn overflowed(&self) -> bool {
        self.pending.len() > MAX_LINE_BUFFER_BYTES
    }

    /// Decodes the unterminated tail left when the connection closes.
    pub fn finish(self) -> SseLine {
        if self.pending.is_empty() {
            return SseLine::Ignored;
        }
        decode_line(&String::from_utf8_lossy(&self.pending))
    }
}

/// Removes the next complete line from `buffer`, without its terminator.
pub fn drain_next_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

/// Decodes a single stream line.
pub fn decode_line(line: &str) -> SseLine {
    let Some(mut data) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    if let Some(stripped) = data.strip_prefix(' ') {
        data = stripped;
    }

    if data.trim() == DONE_SENTINEL {
        return SseLine::Done;
    }

    let Ok(json) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(frame = %data, "Skipping undecodable stream frame");
        return SseLine::Ignored;
    };

    match delta_content(&json) {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Ignored,
    }
}

/// Extracts `choices[0].delta.content` from a chunk.
fn delta_content(chunk: &Value) -> Option<&str> {
    chunk
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
}
