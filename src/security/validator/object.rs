//! Generic object / JSON sanitization.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::patterns::DANGEROUS_KEYS;
use super::{InputValidator, ValidationResult};
use crate::security::events::{EventKind, Severity};

static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^&(?:[A-Za-z][A-Za-z0-9]{1,31}|#[0-9]{1,7}|#[xX][0-9A-Fa-f]{1,6});")
        .expect("valid regex")
});

/// HTML-entity-escape `& < > " '`, leaving existing entities intact so
/// repeated escaping is a no-op.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for (i, c) in input.char_indices() {
        match c {
            '&' if ENTITY.is_match(&input[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Default)]
struct Walk {
    errors: Vec<String>,
    warnings: Vec<String>,
    dropped: Vec<String>,
    escaped: usize,
    too_deep: bool,
}

impl Walk {
    fn visit(&mut self, value: &Value, depth: usize, max_depth: usize) -> Value {
        match value {
            Value::String(s) => {
                let escaped = escape_html(s);
                if escaped != *s {
                    self.escaped += 1;
                }
                Value::String(escaped)
            }
            Value::Array(items) => {
                if self.exceeds(depth, max_depth) {
                    return Value::Null;
                }
                Value::Array(
                    items
                        .iter()
                        .map(|item| self.visit(item, depth + 1, max_depth))
                        .collect(),
                )
            }
            Value::Object(fields) => {
                if self.exceeds(depth, max_depth) {
                    return Value::Null;
                }
                let mut clean = Map::new();
                for (key, field) in fields {
                    if DANGEROUS_KEYS.contains(&key.as_str()) {
                        self.warnings.push(format!("Removed dangerous key: {}", key));
                        self.dropped.push(key.clone());
                        continue;
                    }
                    clean.insert(key.clone(), self.visit(field, depth + 1, max_depth));
                }
                Value::Object(clean)
            }
            other => other.clone(),
        }
    }

    fn exceeds(&mut self, depth: usize, max_depth: usize) -> bool {
        if depth > max_depth {
            if !self.too_deep {
                self.too_deep = true;
                self.errors
                    .push(format!("Object nesting depth exceeds maximum of {}", max_depth));
            }
            return true;
        }
        false
    }
}

impl InputValidator {
    /// Escape every string leaf and drop prototype-pollution keys.
    pub fn sanitize_object(&self, value: &Value) -> ValidationResult<Value> {
        let mut walk = Walk::default();
        let sanitized = walk.visit(value, 1, self.config.max_nesting_depth);

        for key in &walk.dropped {
            self.report(
                EventKind::PrototypePollution,
                Severity::High,
                key,
                "dangerous key removed from object",
            );
        }
        if walk.too_deep {
            self.report(
                EventKind::ConfigInjection,
                Severity::High,
                "",
                &format!("object deeper than {}", self.config.max_nesting_depth),
            );
        }
        if walk.escaped > 0 {
            self.report(
                EventKind::Sanitization,
                Severity::Low,
                "",
                &format!("{} string value(s) escaped", walk.escaped),
            );
        }

        ValidationResult::new(sanitized, walk.errors, walk.warnings)
    }

    /// Parse JSON text, then sanitize the resulting value.
    pub fn validate_json(&self, text: &str) -> ValidationResult<Value> {
        if text.len() > self.config.max_config_length {
            return ValidationResult::invalid(
                vec![format!(
                    "JSON exceeds maximum length of {} bytes",
                    self.config.max_config_length
                )],
                Vec::new(),
            );
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.sanitize_object(&value),
            Err(e) => ValidationResult::invalid(vec![format!("Invalid JSON: {}", e)], Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::validator::test_validator;
    use serde_json::json;

    #[test]
    fn escape_html_basic() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom's & co</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom&#x27;s &amp; co&lt;/a&gt;"
        );
    }

    #[test]
    fn escape_html_keeps_existing_entities() {
        assert_eq!(escape_html("&amp; &#39; &#x27; &lt;"), "&amp; &#39; &#x27; &lt;");
        assert_eq!(escape_html("AT&T a&b"), "AT&amp;T a&amp;b");
        assert_eq!(escape_html("&;"), "&amp;;");
    }

    #[test]
    fn dangerous_keys_dropped_at_any_level() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let input = json!({
            "title": "ok",
            "__proto__": {"admin": true},
            "nested": {"constructor": {"prototype": 1}, "keep": [1, 2]}
        });
        let result = v.sanitize_object(&input);
        assert!(result.is_valid());
        assert_eq!(
            result.sanitized_value().unwrap(),
            &json!({"title": "ok", "nested": {"keep": [1, 2]}})
        );
        assert_eq!(result.warnings().len(), 2);
        assert_eq!(
            v.auditor().trail().of_kind(EventKind::PrototypePollution).len(),
            2
        );
    }

    #[test]
    fn string_leaves_escaped_once() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let input = json!({"a": ["<b>", "plain", 3, null], "b": "x & y"});
        let result = v.sanitize_object(&input);
        let clean = result.sanitized_value().unwrap();
        assert_eq!(clean["a"][0], "&lt;b&gt;");
        assert_eq!(clean["a"][2], 3);
        assert_eq!(clean["b"], "x &amp; y");

        let again = v.sanitize_object(clean);
        assert_eq!(again.sanitized_value().unwrap(), clean);
        assert_eq!(v.auditor().trail().of_kind(EventKind::Sanitization).len(), 1);
    }

    #[test]
    fn depth_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let mut deep = json!("leaf");
        for _ in 0..12 {
            deep = json!({ "k": deep });
        }
        let result = v.sanitize_object(&deep);
        assert!(!result.is_valid());
        assert_eq!(result.errors().len(), 1);

        let mut shallow = json!("leaf");
        for _ in 0..10 {
            shallow = json!({ "k": shallow });
        }
        assert!(v.sanitize_object(&shallow).is_valid());
    }

    #[test]
    fn json_is_parsed_then_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());

        let result = v.validate_json(r#"{"__proto__": {"polluted": true}, "name": "<i>"}"#);
        assert!(result.is_valid());
        assert_eq!(result.sanitized_value().unwrap(), &json!({"name": "&lt;i&gt;"}));

        let broken = v.validate_json("{not json");
        assert!(!broken.is_valid());
        assert!(broken.errors()[0].starts_with("Invalid JSON"));
    }
}
