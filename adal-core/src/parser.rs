//! Output parsing from raw model text into structured records.
//!
//! Parsers turn the raw completion of a generator into a JSON record. A
//! failure is a [`ParseError`], which the generator records on its output
//! instead of aborting the run.

use serde_json::Value;
use std::fmt;

/// Error that occurs when parsing a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Response was not valid JSON
    InvalidJson {
        /// The parse error message
        message: String,
        /// Preview of the response that failed to parse
        response_preview: String,
    },

    /// JSON parsed but a required field was absent
    MissingField(String),

    /// JSON parsed but was not an object
    StructureMismatch {
        /// What was expected
        expected: String,
        /// What was found
        got: String,
    },

    /// Response was empty or contained no extractable content
    EmptyResponse,
}

impl ParseError {
    /// Create an invalid JSON error from a serde error.
    pub fn invalid_json(err: &serde_json::Error, response: &str) -> Self {
        Self::InvalidJson {
            message: err.to_string(),
            response_preview: truncate(response, 200),
        }
    }

    /// Create a structure mismatch error.
    pub fn structure_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::StructureMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson {
                message,
                response_preview,
            } => write!(
                f,
                "Failed to parse response as JSON: {}. Response: {}",
                message, response_preview
            ),
            Self::MissingField(field) => write!(f, "Response is missing required field '{}'", field),
            Self::StructureMismatch { expected, got } => write!(
                f,
                "Response structure mismatch: expected {}, got {}",
                expected, got
            ),
            Self::EmptyResponse => write!(f, "Model returned an empty response"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Output-parser capability.
pub trait OutputParser: Send + Sync {
    /// Parse raw model text into a structured record.
    fn parse(&self, raw: &str) -> Result<Value, ParseError>;

    /// Instructions appended to the prompt describing the expected format.
    fn format_instructions(&self) -> String {
        String::new()
    }
}

/// Parses a JSON object out of the response and checks required fields.
#[derive(Debug, Clone, Default)]
pub struct JsonOutputParser {
    required: Vec<(String, String)>,
}

impl JsonOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a field, described to the model by `description`.
    pub fn require(mut self, field: impl Into<String>, description: impl Into<String>) -> Self {
        self.required.push((field.into(), description.into()));
        self
    }
}

impl OutputParser for JsonOutputParser {
    fn parse(&self, raw: &str) -> Result<Value, ParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ParseError::EmptyResponse);
        }

        let json_str = extract_json(raw);
        let value: Value =
            serde_json::from_str(json_str).map_err(|e| ParseError::invalid_json(&e, json_str))?;

        let Value::Object(map) = &value else {
            return Err(ParseError::structure_mismatch("object", json_kind(&value)));
        };
        for (field, _) in &self.required {
            if !map.contains_key(field) {
                return Err(ParseError::MissingField(field.clone()));
            }
        }

        Ok(value)
    }

    fn format_instructions(&self) -> String {
        if self.required.is_empty() {
            return "Respond with only a JSON object, no additional text.".to_string();
        }
        let mut out = String::from("Respond with only a JSON object containing these fields:\n");
        for (field, description) in &self.required {
            out.push_str(&format!("- {}: {}\n", field, description));
        }
        out
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extract JSON from a response that may contain markdown or other text.
pub fn extract_json(response: &str) -> &str {
    // Fenced json block
    if let Some(start) = response.find("```json") {
        let content_start = start + 7;
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }

    // Generic fenced block, skipping the language tag line
    if let Some(start) = response.find("```") {
        let content_start = start + 3;
        let content_start = response[content_start..]
            .find('\n')
            .map(|i| content_start + i + 1)
            .unwrap_or(content_start);
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }

    // Raw object
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return &response[start..=end];
            }
        }
    }

    response
}

/// Truncate a string to at most `max_len` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answer_parser() -> JsonOutputParser {
        JsonOutputParser::new().require("answer", "short factual answer")
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here you go:\n```json\n{\"answer\": \"yes\"}\n```";
        assert_eq!(answer_parser().parse(raw).unwrap(), json!({"answer": "yes"}));
    }

    #[test]
    fn test_parse_embedded_object() {
        let raw = "Reasoning first. {\"reasoning\": \"both American\", \"answer\": \"yes\"} done";
        let value = answer_parser().parse(raw).unwrap();
        assert_eq!(value["answer"], "yes");
        assert_eq!(value["reasoning"], "both American");
    }

    #[test]
    fn test_missing_required_field() {
        let err = answer_parser().parse(r#"{"reasoning": "hmm"}"#).unwrap_err();
        assert_eq!(err, ParseError::MissingField("answer".to_string()));
    }

    #[test]
    fn test_empty_and_invalid() {
        assert_eq!(answer_parser().parse("   ").unwrap_err(), ParseError::EmptyResponse);
        assert!(matches!(
            answer_parser().parse("no json here").unwrap_err(),
            ParseError::InvalidJson { .. }
        ));
        assert!(matches!(
            answer_parser().parse("[1, 2]").unwrap_err(),
            ParseError::StructureMismatch { .. }
        ));
    }

    #[test]
    fn test_format_instructions_lists_fields() {
        let text = answer_parser().format_instructions();
        assert!(text.contains("answer: short factual answer"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h...");
        assert_eq!(truncate("short", 10), "short");
    }
}
