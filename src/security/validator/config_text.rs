//! Structured-config text (YAML/TOML) validation.

use super::patterns::{CONFIG_SIGNATURES, strip_control_chars};
use super::{InputValidator, ValidationResult};
use crate::security::events::{EventKind, Severity, snippet};

impl InputValidator {
    /// Validate raw config text before it is parsed or merged.
    ///
    /// Full-line `#` comments and control characters are stripped; the
    /// stripped text is what gets scanned, so a payload split by control
    /// bytes is still caught.
    pub fn validate_config_text(&self, text: &str) -> ValidationResult<String> {
        let max = self.config.max_config_length;
        if text.len() > max {
            let message = format!("Configuration exceeds maximum length of {} bytes", max);
            self.report(
                EventKind::ConfigInjection,
                Severity::High,
                &text[..floor_char_boundary(text, 64)],
                &message,
            );
            return ValidationResult::invalid(vec![message], Vec::new());
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let sanitized = sanitize_config_text(text);
        if sanitized != text {
            warnings.push("Comments and control characters were removed".to_string());
        }

        for sig in CONFIG_SIGNATURES.iter() {
            if let Some(found) = sig.regex.find(&sanitized) {
                self.report(sig.kind, sig.severity, found.as_str(), sig.message);
                errors.push(format!("{}: {}", sig.message, snippet(found.as_str())));
            }
        }

        let layout = analyze_layout(&sanitized);
        for line in &layout.tab_lines {
            errors.push(format!("Tab character used for indentation on line {}", line));
        }
        for line in &layout.inconsistent_lines {
            warnings.push(format!("Inconsistent indentation on line {}", line));
        }
        if layout.max_depth > self.config.max_nesting_depth {
            let message = format!(
                "Nesting depth {} exceeds maximum of {}",
                layout.max_depth, self.config.max_nesting_depth
            );
            self.report(EventKind::ConfigInjection, Severity::High, "", &message);
            errors.push(message);
        }

        ValidationResult::new(sanitized, errors, warnings)
    }
}

/// Drop full-line comments and control characters, normalizing CRLF.
fn sanitize_config_text(text: &str) -> String {
    strip_control_chars(text, true)
        .split_inclusive('\n')
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect()
}

#[derive(Debug, Default)]
struct Layout {
    max_depth: usize,
    tab_lines: Vec<usize>,
    inconsistent_lines: Vec<usize>,
}

/// Measure structural depth from block indentation plus flow brackets.
fn analyze_layout(text: &str) -> Layout {
    let mut layout = Layout::default();
    let mut indent_stack: Vec<usize> = Vec::new();
    let mut unit: Option<usize> = None;
    let mut brackets: usize = 0;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let leading: &str = &line[..line.len() - line.trim_start().len()];
        if leading.contains('\t') {
            layout.tab_lines.push(line_no);
        }
        let indent = leading.chars().filter(|c| *c == ' ').count();

        if indent > 0 {
            match unit {
                None => unit = Some(indent),
                Some(u) if indent % u != 0 => layout.inconsistent_lines.push(line_no),
                _ => {}
            }
        }

        while indent_stack.last().is_some_and(|top| *top > indent) {
            indent_stack.pop();
        }
        if indent_stack.last().is_none_or(|top| *top < indent) {
            indent_stack.push(indent);
        }

        let mut in_quote: Option<char> = None;
        for c in line.chars() {
            match (in_quote, c) {
                (Some(q), c) if c == q => in_quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => in_quote = Some(c),
                (None, '[') | (None, '{') => {
                    brackets += 1;
                    layout.max_depth = layout.max_depth.max(indent_stack.len() + brackets);
                }
                (None, ']') | (None, '}') => brackets = brackets.saturating_sub(1),
                _ => {}
            }
        }

        layout.max_depth = layout.max_depth.max(indent_stack.len() + brackets);
    }

    layout
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::validator::{ValidatorConfig, test_validator};

    fn nested_yaml(depth: usize) -> String {
        (0..depth)
            .map(|i| format!("{}k{}:\n", "  ".repeat(i), i))
            .collect::<String>()
    }

    #[test]
    fn clean_config_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let text = "project:\n  name: docs\n  output: build/site\n";
        let result = v.validate_config_text(text);
        assert!(result.is_valid(), "{:?}", result.errors());
        assert_eq!(result.sanitized_value().unwrap(), text);
    }

    #[test]
    fn comments_and_control_chars_are_stripped() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_config_text("# header\r\nname: a\x07b\r\n");
        assert!(result.is_valid());
        assert_eq!(result.sanitized_value().unwrap(), "name: ab\n");
        assert!(!result.warnings().is_empty());
    }

    #[test]
    fn injection_signatures_are_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_config_text("title: ${process.env.TOKEN}\nbody: <script>x</script>\n");
        assert!(!result.is_valid());
        assert!(result.sanitized_value().is_none());
        assert!(result.errors().iter().any(|e| e.starts_with("Template interpolation")));
        assert!(result.errors().iter().any(|e| e.starts_with("Script content")));
        assert!(result.errors().iter().any(|e| e.starts_with("Process access")));
        assert_eq!(v.auditor().trail().of_kind(EventKind::ScriptInjection).len(), 1);
    }

    #[test]
    fn payload_split_by_control_bytes_is_caught() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_config_text("x: ev\x00al(1)\n");
        assert!(!result.is_valid());
    }

    #[test]
    fn oversized_config_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ValidatorConfig {
            max_config_length: 10,
            allowed_root: Some(tmp.path().to_string_lossy().into_owned()),
            ..ValidatorConfig::default()
        };
        let v = InputValidator::new(config, std::sync::Arc::new(Default::default()));
        let result = v.validate_config_text("key: value that is long");
        assert!(!result.is_valid());
        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].contains("maximum length"));
    }

    #[test]
    fn depth_limit_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        assert!(v.validate_config_text(&nested_yaml(10)).is_valid());

        let result = v.validate_config_text(&nested_yaml(11));
        assert!(!result.is_valid());
        assert!(result.errors()[0].contains("Nesting depth 11"));
    }

    #[test]
    fn flow_brackets_count_toward_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let deep = format!("x: {}{}\n", "[".repeat(12), "]".repeat(12));
        assert!(!v.validate_config_text(&deep).is_valid());
        assert!(v.validate_config_text("x: [1, {a: \"[[[[\"}]\n").is_valid());
    }

    #[test]
    fn tab_indentation_is_error_and_odd_width_is_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());

        let tabs = v.validate_config_text("a:\n\tb: 1\n");
        assert!(!tabs.is_valid());
        assert!(tabs.errors()[0].contains("line 2"));

        let odd = v.validate_config_text("a:\n  b:\n     c: 1\n");
        assert!(odd.is_valid());
        assert!(odd.warnings().iter().any(|w| w.contains("line 3")));
    }

    #[test]
    fn revalidating_sanitized_output_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let first = v.validate_config_text("# c\nname: a\x01b\n  # nested comment\nlist: [1, 2]\n");
        let sanitized = first.sanitized_value().unwrap().clone();
        let second = v.validate_config_text(&sanitized);
        assert_eq!(second.sanitized_value().unwrap(), &sanitized);
        assert!(second.errors().is_empty());
        assert!(second.warnings().is_empty());
    }
}
