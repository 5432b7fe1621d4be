//! Lenient extraction of structured fields from model responses
//!
//! Nothing here fails: absent or malformed fields fall back to 0.0, `false`
//! or a sentinel string.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

pub const NO_FORMULA: &str = "No valid formula found";
pub const NO_VARIABLES: &str = "No variables found";

lazy_static! {
    static ref SCORE: Regex = Regex::new(r#"(?i)"score"\s*:\s*"?(-?\d+(?:\.\d+)?)"#).unwrap();
    static ref APPROVED: Regex = Regex::new(r#"(?i)"approved"\s*:\s*"?(true|false)\b"#).unwrap();
    static ref JSON_VARIABLES: Regex =
        Regex::new(r#"(?s)```json\s*\n.*?"variables"\s*:\s*\{(.*?)\}"#).unwrap();
    static ref KEY_VALUE: Regex = Regex::new(r#""(.*?)"\s*:\s*"(.*?)""#).unwrap();
    static ref TEXT_VARIABLE: Regex = Regex::new(r"(?im)\bVariable\s*(\d+):?[ \t]*(.+?)[ \t]*$").unwrap();
    static ref JSON_FORMULA: Regex = Regex::new(r#"(?s)```json\s*\n.*?"formula"\s*:\s*"(.*?)""#).unwrap();
    static ref TEXT_FORMULA: Regex = Regex::new(r"(?im)\bformula\b[ \t]*[:\n]*[ \t]*(.+?)[ \t]*$").unwrap();
    static ref OPERATOR: Regex = Regex::new(r"[+\-*/]").unwrap();
    static ref OPERAND: Regex = Regex::new(r"\d|[A-Za-z_]").unwrap();
    static ref CODE_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\n(.*?)```").unwrap();
    static ref JSON_BLOCK: Regex = Regex::new(r"(?s)```json\s*\n(.*?)```").unwrap();
}

/// `"score": <number>` anywhere in the text, else 0.0.
pub fn extract_score(text: &str) -> f64 {
    SCORE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|score| score.is_finite())
        .unwrap_or(0.0)
}

/// `"Approved": true|false`; `None` when the field is missing.
pub fn parse_approval(text: &str) -> Option<bool> {
    APPROVED
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("true"))
}

/// Approval flag, treating a missing field as rejection.
pub fn extract_approved(text: &str) -> bool {
    parse_approval(text).unwrap_or(false)
}

fn looks_arithmetic(candidate: &str) -> bool {
    OPERATOR.is_match(candidate) && OPERAND.is_match(candidate)
}

/// Formula from a fenced JSON `formula` field, else the last `Formula:` line
/// that contains an operator.
pub fn extract_formula(text: &str) -> String {
    if let Some(candidate) = JSON_FORMULA
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
    {
        if looks_arithmetic(candidate) {
            return candidate.to_string();
        }
    }

    TEXT_FORMULA
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
        .filter(|candidate| looks_arithmetic(candidate))
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| NO_FORMULA.to_string())
}

/// Variable descriptions from a fenced JSON `variables` object, else from
/// `Variable N:` lines. Sorted, de-duplicated, comma separated.
pub fn extract_variables(text: &str) -> String {
    let mut variables: BTreeSet<String> = BTreeSet::new();

    if let Some(body) = JSON_VARIABLES.captures(text).and_then(|caps| caps.get(1)) {
        variables.extend(
            KEY_VALUE
                .captures_iter(body.as_str())
                .filter_map(|caps| caps.get(2))
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty()),
        );
    }

    if variables.is_empty() {
        variables.extend(
            TEXT_VARIABLE
                .captures_iter(text)
                .filter_map(|caps| caps.get(2))
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty()),
        );
    }

    if variables.is_empty() {
        return NO_VARIABLES.to_string();
    }
    variables.into_iter().collect::<Vec<_>>().join(", ")
}

/// Body of the first fenced code block, or the whole response.
pub fn extract_code_block(text: &str) -> String {
    CODE_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim()
        .to_string()
}

/// Per-stage comments and approval from a final review.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Critique {
    pub reasoner_comment: String,
    pub extractor_comment: String,
    pub executor_comment: String,
    pub approved: bool,
}

/// Reads the first JSON object in the response. Keys are matched loosely
/// (`reasoner_comment`, `Reasoner Comment`, ...). Unstructured text becomes
/// the executor comment.
pub fn parse_critique(text: &str) -> Critique {
    let Some(Value::Object(fields)) = find_json_object(text) else {
        return Critique {
            executor_comment: text.trim().to_string(),
            approved: extract_approved(text),
            ..Default::default()
        };
    };

    let mut critique = Critique::default();
    for (key, value) in fields {
        let key: String = key
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if key.starts_with("approv") {
            critique.approved = match &value {
                Value::Bool(b) => *b,
                Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
                _ => false,
            };
            continue;
        }

        let comment = match value {
            Value::String(s) => s,
            Value::Null => continue,
            other => other.to_string(),
        };
        if key.contains("reason") {
            critique.reasoner_comment = comment;
        } else if key.contains("extract") {
            critique.extractor_comment = comment;
        } else if key.contains("execut") {
            critique.executor_comment = comment;
        }
    }
    critique
}

fn find_json_object(text: &str) -> Option<Value> {
    let fenced = JSON_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| serde_json::from_str::<Value>(m.as_str().trim()).ok());
    if fenced.is_some() {
        return fenced;
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end]).ok()
}
