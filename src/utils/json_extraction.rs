//! JSON extraction from model output.
//!
//! Models asked for a JSON action frequently wrap it in prose or markdown
//! fences, or get cut off mid-object. The extractor tries, in order:
//! 1. The whole trimmed text as JSON
//! 2. The first fenced code block (```json or bare ```)
//! 3. The first balanced `{...}` span that parses
//!
//! and reports unterminated objects separately from "no JSON at all" so the
//! caller can produce a useful error.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("model output is empty")]
    Empty,

    #[error("JSON appears truncated: {unclosed_braces} unclosed braces, {unclosed_brackets} unclosed brackets")]
    Truncated {
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },

    #[error("no JSON object found in model output starting with '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Brace/bracket balance of a text, ignoring string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonStructureAnalysis {
    /// Number of '{' without matching '}'.
    pub unclosed_braces: usize,
    /// Number of '[' without matching ']'.
    pub unclosed_brackets: usize,
    /// Whether the text ended inside a string literal.
    pub in_string: bool,
}

impl JsonStructureAnalysis {
    /// Whether the text looks like a JSON value that was cut off.
    pub fn is_truncated(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string
    }
}

/// Scan `s` and track brace/bracket depth outside string literals.
pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut braces: isize = 0;
    let mut brackets: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces -= 1,
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets -= 1,
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: braces.max(0) as usize,
        unclosed_brackets: brackets.max(0) as usize,
        in_string,
    }
}

/// Find the index of the '}' matching the '{' at the start of `s`.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn code_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("static regex is valid")
    })
}

/// Contents of the first fenced code block, if any.
pub fn extract_from_code_block(content: &str) -> Option<String> {
    code_block_regex()
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_balanced_object(content: &str) -> Option<Value> {
    let mut offset = 0;
    while let Some(rel) = content[offset..].find('{') {
        let start = offset + rel;
        let end = find_matching_brace(&content[start..])?;
        if let Ok(value) = serde_json::from_str::<Value>(&content[start..=start + end]) {
            return Some(value);
        }
        offset = start + 1;
    }
    None
}

/// Extract the first JSON object from model output.
///
/// # Errors
///
/// - `Empty` for blank output
/// - `Truncated` when an object starts but never closes
/// - `NotFound` when nothing object-shaped parses
pub fn extract_json_object(content: &str) -> Result<Value, JsonExtractionError> {
    let trimmed = content.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(JsonExtractionError::Empty);
    }

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = extract_from_code_block(trimmed) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&block) {
            return Ok(value);
        }
    }

    if let Some(value) = first_balanced_object(trimmed) {
        return Ok(value);
    }

    if let Some(start) = trimmed.find('{') {
        let analysis = analyze_json_structure(&trimmed[start..]);
        if analysis.is_truncated() {
            return Err(JsonExtractionError::Truncated {
                unclosed_braces: analysis.unclosed_braces,
                unclosed_brackets: analysis.unclosed_brackets,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: trimmed.chars().take(50).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_object() {
        let value = extract_json_object(r#"{"kind": "final", "final": {"proceed": true}}"#)
            .expect("should parse");
        assert_eq!(value["kind"], "final");
        assert_eq!(value["final"]["proceed"], true);
    }

    #[test]
    fn test_code_block_object() {
        let content = "Here is my action:\n```json\n{\"kind\": \"tool_call\", \"toolName\": \"read\"}\n```\n";
        let value = extract_json_object(content).expect("should parse");
        assert_eq!(value["toolName"], "read");
    }

    #[test]
    fn test_object_after_prose() {
        let content = "Let me think... I will read the context first. {\"kind\":\"tool_call\",\"toolName\":\"ctx\"} done";
        let value = extract_json_object(content).expect("should parse");
        assert_eq!(value, json!({"kind": "tool_call", "toolName": "ctx"}));
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let content = r#"note {"kind": "final", "final": "a } b { c"}"#;
        let value = extract_json_object(content).expect("should parse");
        assert_eq!(value["final"], "a } b { c");
    }

    #[test]
    fn test_truncated_object() {
        let err = extract_json_object(r#"{"kind": "final", "final": {"proceed": tr"#)
            .expect_err("should be truncated");
        assert!(matches!(err, JsonExtractionError::Truncated { unclosed_braces: 2, .. }));
    }

    #[test]
    fn test_not_found_and_empty() {
        assert_eq!(extract_json_object("   "), Err(JsonExtractionError::Empty));
        assert!(matches!(
            extract_json_object("no json here"),
            Err(JsonExtractionError::NotFound { .. })
        ));
    }

    #[test]
    fn test_bare_array_is_not_an_object() {
        assert!(extract_json_object("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_find_matching_brace() {
        assert_eq!(find_matching_brace(r#"{"a": {"b": 1}} tail"#), Some(14));
        assert_eq!(find_matching_brace(r#"{"a": 1"#), None);
    }
}
