//! PII redaction and structural sanitization of log content.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";
pub const MAX_DEPTH_MARKER: &str = "[MAX_DEPTH_EXCEEDED]";
pub const TRUNCATED_MARKER: &str = "…[TRUNCATED]";

struct Rule {
    regex: Lazy<Regex>,
    replacement: &'static str,
}

macro_rules! rule {
    ($pattern:expr, $replacement:expr) => {
        Rule {
            regex: Lazy::new(|| Regex::new($pattern).expect("valid regex")),
            replacement: $replacement,
        }
    };
}

/// Applied in order; earlier rules win over overlapping later ones.
static RULES: [Rule; 11] = [
    rule!(
        r#"(?i)\b((?:password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|private[_-]?key|client[_-]?secret)\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
        "${1}[REDACTED]"
    ),
    rule!(r"(?i)\bBearer\s+[A-Za-z0-9\-._~+/]+=*", "Bearer [REDACTED]"),
    rule!(
        r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
        "[REDACTED_JWT]"
    ),
    rule!(
        r"\b(?:sk|pk|rk)_(?:live|test)_[A-Za-z0-9]{8,}|\b(?:sk|pk)-[A-Za-z0-9_-]{16,}|\bAKIA[0-9A-Z]{16}\b|\bgh[pousr]_[A-Za-z0-9]{20,}|\b[A-Za-z0-9]{32,}\b",
        "[REDACTED_KEY]"
    ),
    rule!(
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        "[REDACTED_EMAIL]"
    ),
    rule!(r"\b\d{3}-\d{2}-\d{4}\b", "[REDACTED_SSN]"),
    rule!(r"\b(?:\d[ -]?){12,18}\d\b", "[REDACTED_CARD]"),
    rule!(
        r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]\d{4}\b",
        "[REDACTED_PHONE]"
    ),
    rule!(
        r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b",
        "[REDACTED_IP]"
    ),
    rule!(
        r"(?i)\b(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}\b|\b(?:[0-9a-f]{1,4}:){1,6}:(?:[0-9a-f]{1,4}(?::[0-9a-f]{1,4}){0,5})?",
        "[REDACTED_IP]"
    ),
    rule!(r"(/home/|/Users/|[A-Za-z]:\\Users\\)[^/\\\s]+", "${1}[USER]"),
];

/// Redact PII from free text. Returns the text and whether anything changed.
pub fn redact(text: &str) -> (String, bool) {
    let mut out = text.to_string();
    let mut changed = false;
    for rule in RULES.iter() {
        if rule.regex.is_match(&out) {
            out = rule.regex.replace_all(&out, rule.replacement).into_owned();
            changed = true;
        }
    }
    (out, changed)
}

/// Redact every string leaf of a JSON value.
pub fn redact_value(value: &Value) -> (Value, bool) {
    let mut changed = false;
    let out = map_strings(value, &mut |s| {
        let (r, hit) = redact(s);
        changed |= hit;
        r
    });
    (out, changed)
}

/// Apply `f` to every string leaf.
pub fn map_strings(value: &Value, f: &mut dyn FnMut(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), map_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Cut `text` to `max_chars`, appending the truncation marker.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &text[..idx], TRUNCATED_MARKER),
        None => text.to_string(),
    }
}

/// True when a key or message names secret material.
pub fn is_sensitive_key(key: &str, keywords: &[String]) -> bool {
    let lower = key.to_ascii_lowercase();
    keywords.iter().any(|k| lower.contains(k.as_str()))
}

/// Bound depth, truncate strings, and mask values under sensitive keys.
pub fn sanitize_context(
    value: &Value,
    depth: usize,
    max_depth: usize,
    max_len: usize,
    keywords: &[String],
) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, max_len)),
        Value::Array(_) | Value::Object(_) if depth >= max_depth => {
            Value::String(MAX_DEPTH_MARKER.to_string())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| sanitize_context(v, depth + 1, max_depth, max_len, keywords))
                .collect(),
        ),
        Value::Object(fields) => {
            let mut clean = Map::new();
            for (key, field) in fields {
                let value = if is_sensitive_key(key, keywords) {
                    Value::String(REDACTED.to_string())
                } else {
                    sanitize_context(field, depth + 1, max_depth, max_len, keywords)
                };
                clean.insert(key.clone(), value);
            }
            Value::Object(clean)
        }
        other => other.clone(),
    }
}
