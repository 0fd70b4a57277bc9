//! Structured-output recovery for free-form model responses.
//!
//! The completion service is a prose generator: it may wrap JSON in markdown
//! fences, surround it with commentary, or not produce JSON at all. Parsing is
//! therefore a total function. Every input yields a [`ParsedOutput`], either a
//! structured value or the raw text verbatim.
//!
//! # Extraction Strategies
//!
//! The cascade tries the following strategies in order, first success wins:
//! 1. The entire text as a JSON document
//! 2. The inner content of the first fenced code block (optionally tagged `json`)
//! 3. The span from the first `{` to the last `}`, then from the first `[` to
//!    the last `]`
//! 4. A fallback record carrying the original text unchanged
//!
//! # Example
//!
//! ```
//! use discovery_forge::utils::json_extraction::parse_model_output;
//!
//! let parsed = parse_model_output("Sure! {\"chain_status\": \"VALID\"} Hope that helps.");
//! assert_eq!(parsed.get_str("chain_status").as_deref(), Some("VALID"));
//!
//! let prose = parse_model_output("no structure here");
//! assert_eq!(prose.raw_text(), Some("no structure here"));
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name used by the fallback record.
pub const RAW_TEXT_FIELD: &str = "raw_text";

/// Result of parsing a model response.
///
/// Serialized with an explicit variant tag (`{"structured": ..}` or
/// `{"unparsed": {"raw_text": ..}}`) so any model answer, `null` and
/// raw-text-shaped objects included, survives a checkpoint round trip.
/// [`ParsedOutput::to_value`] gives the untagged view used in prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsedOutput {
    /// The response contained a parseable JSON document.
    Structured(Value),
    /// Nothing structured could be recovered; the text is kept verbatim.
    Unparsed { raw_text: String },
}

impl ParsedOutput {
    /// Returns true if a structured value was recovered.
    pub fn is_structured(&self) -> bool {
        matches!(self, ParsedOutput::Structured(_))
    }

    /// Returns the raw text of the fallback variant.
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            ParsedOutput::Unparsed { raw_text } => Some(raw_text),
            ParsedOutput::Structured(_) => None,
        }
    }

    /// Returns the structured value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ParsedOutput::Structured(value) => Some(value),
            ParsedOutput::Unparsed { .. } => None,
        }
    }

    /// Returns the structured value when it is a JSON object.
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.value().and_then(Value::as_object)
    }

    /// Returns the structured value when it is a JSON array.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        self.value().and_then(Value::as_array)
    }

    /// Looks up a field of an object-shaped response.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|obj| obj.get(key))
    }

    /// Looks up a field and renders it as text.
    ///
    /// Strings are returned as-is; any other non-null value is rendered as
    /// pretty-printed JSON so it can be spliced into the next prompt.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(value_text)
    }

    /// Converts to a JSON value, materializing the fallback record.
    pub fn to_value(&self) -> Value {
        self.clone().into()
    }
}

impl From<ParsedOutput> for Value {
    fn from(parsed: ParsedOutput) -> Self {
        match parsed {
            ParsedOutput::Structured(value) => value,
            ParsedOutput::Unparsed { raw_text } => {
                let mut obj = Map::new();
                obj.insert(RAW_TEXT_FIELD.to_string(), Value::String(raw_text));
                Value::Object(obj)
            }
        }
    }
}

/// Renders a JSON value as prompt text.
///
/// Returns `None` for `null` so callers can fall back to a default.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())),
    }
}

/// Parses a model response with the full recovery cascade.
///
/// Never fails: when no strategy succeeds the original text is returned
/// inside [`ParsedOutput::Unparsed`], byte for byte.
pub fn parse_model_output(text: &str) -> ParsedOutput {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return ParsedOutput::Structured(value);
    }

    if let Some(inner) = extract_fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return ParsedOutput::Structured(value);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(span) = extract_bracketed(text, open, close) {
            if let Ok(value) = serde_json::from_str::<Value>(span) {
                return ParsedOutput::Structured(value);
            }
        }
    }

    ParsedOutput::Unparsed {
        raw_text: text.to_string(),
    }
}

/// Extracts the content of the first ``` fenced block.
///
/// The fence may carry a `json` language tag. Returns `None` when no closed
/// fence exists.
pub fn extract_fenced_block(content: &str) -> Option<&str> {
    let re = Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    Some(caps.get(1)?.as_str())
}

/// Returns the span from the first `open` to the last `close`, inclusive.
///
/// No bracket matching is attempted; the span is only a candidate and must
/// still be validated by the JSON parser.
pub fn extract_bracketed(content: &str, open: char, close: char) -> Option<&str> {
    let start = content.find(open)?;
    let end = content.rfind(close)?;
    if end > start {
        Some(&content[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_json_object() {
        let parsed = parse_model_output(r#"{"key": "value"}"#);
        assert_eq!(parsed, ParsedOutput::Structured(json!({"key": "value"})));
    }

    #[test]
    fn test_serialized_value_is_recovered() {
        let value = json!({
            "chain_status": "FIXABLE",
            "gaps": ["cooling stage"],
            "overall_conditions": {"temperature_range": "300-5000 K"},
            "n": 3.5
        });
        let text = serde_json::to_string_pretty(&value).unwrap();
        assert_eq!(parse_model_output(&text), ParsedOutput::Structured(value));
    }

    #[test]
    fn test_json_code_block() {
        let input = "Here is the response:\n```json\n{\"key\": \"value\"}\n```\nHope this helps!";
        assert_eq!(
            parse_model_output(input),
            ParsedOutput::Structured(json!({"key": "value"}))
        );
    }

    #[test]
    fn test_fenced_matches_unwrapped() {
        let inner = r#"[{"name": "Shock compression"}, {"name": "Laser annealing"}]"#;
        let fenced = format!("Two approaches:\n```\n{}\n```", inner);
        assert_eq!(parse_model_output(&fenced), parse_model_output(inner));
    }

    #[test]
    fn test_commentary_around_object() {
        let input = r#"Sure, here's the JSON: {"name": "test", "count": 5} - that's it!"#;
        assert_eq!(
            parse_model_output(input),
            ParsedOutput::Structured(json!({"name": "test", "count": 5}))
        );
    }

    #[test]
    fn test_array_with_commentary() {
        let input = "The list follows [1, 2, 3] as requested";
        assert_eq!(parse_model_output(input), ParsedOutput::Structured(json!([1, 2, 3])));
    }

    #[test]
    fn test_object_brackets_tried_before_array() {
        let input = r#"noise [1, 2] then {"a": [3]} tail"#;
        // first '{' .. last '}' parses; the array span would not.
        assert_eq!(
            parse_model_output(input),
            ParsedOutput::Structured(json!({"a": [3]}))
        );
    }

    #[test]
    fn test_falls_back_to_array_when_object_span_invalid() {
        let input = r#"[{"a": 1}, {"b": 2}] and a stray } brace"#;
        // '{'..'}' spans into the prose and fails, the array span parses.
        assert_eq!(
            parse_model_output(input),
            ParsedOutput::Structured(json!([{"a": 1}, {"b": 2}]))
        );
    }

    #[test]
    fn test_plain_text_fallback_is_verbatim() {
        let input = "  This is just plain text with no JSON\n\n";
        let parsed = parse_model_output(input);
        assert!(!parsed.is_structured());
        assert_eq!(parsed.raw_text(), Some(input));
    }

    #[test]
    fn test_empty_input_is_total() {
        let parsed = parse_model_output("");
        assert_eq!(parsed.raw_text(), Some(""));
    }

    #[test]
    fn test_broken_braces_fall_back() {
        let input = "{not json at all}";
        assert_eq!(parse_model_output(input).raw_text(), Some(input));
    }

    #[test]
    fn test_unclosed_fence_uses_bracket_strategy() {
        let input = "```json\n{\"key\": 1}";
        assert_eq!(
            parse_model_output(input),
            ParsedOutput::Structured(json!({"key": 1}))
        );
    }

    #[test]
    fn test_get_str_renders_non_strings() {
        let parsed = parse_model_output(r#"{"a": "text", "b": {"x": 1}, "c": null}"#);
        assert_eq!(parsed.get_str("a").as_deref(), Some("text"));
        assert!(parsed.get_str("b").unwrap().contains("\"x\": 1"));
        assert_eq!(parsed.get_str("c"), None);
        assert_eq!(parsed.get_str("missing"), None);
    }

    #[test]
    fn test_fallback_materializes_raw_text_record() {
        let parsed = ParsedOutput::Unparsed {
            raw_text: "prose".to_string(),
        };
        assert_eq!(parsed.to_value(), json!({"raw_text": "prose"}));

        let json = serde_json::to_value(&parsed).unwrap();
        assert_eq!(json, json!({"unparsed": {"raw_text": "prose"}}));
    }

    #[test]
    fn test_serialization_keeps_lookalike_answers_apart() {
        let answers = [
            ParsedOutput::Structured(Value::Null),
            ParsedOutput::Structured(json!({"raw_text": "x"})),
            ParsedOutput::Unparsed {
                raw_text: "x".to_string(),
            },
        ];
        for parsed in answers {
            let text = serde_json::to_string(&parsed).unwrap();
            let back: ParsedOutput = serde_json::from_str(&text).unwrap();
            assert_eq!(back, parsed);
        }

        let some_null: Option<ParsedOutput> =
            serde_json::from_str(r#"{"structured": null}"#).unwrap();
        assert_eq!(some_null, Some(ParsedOutput::Structured(Value::Null)));
    }

    #[test]
    fn test_extract_bracketed_requires_order() {
        assert_eq!(extract_bracketed("} then {", '{', '}'), None);
        assert_eq!(extract_bracketed("a {b} c", '{', '}'), Some("{b}"));
    }

    #[test]
    fn test_extract_fenced_block() {
        assert_eq!(extract_fenced_block("```\nabc\n```"), Some("abc"));
        assert_eq!(extract_fenced_block("no fences"), None);
    }
}
