//! Log-injection detection and neutralization.

use once_cell::sync::Lazy;
use regex::Regex;

pub const FILTERED_PREFIX: &str = "[POTENTIAL_INJECTION_FILTERED] ";

/// Characters of neutralized content kept in the placeholder.
const PLACEHOLDER_CHARS: usize = 100;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("valid regex"));

static FORMAT_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\d*\$?[nNxXpP]").expect("valid regex"));

static TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{|\{\{|<%|#\{").expect("valid regex"));

/// Name of the first injection pattern found, if any.
pub fn detect(text: &str) -> Option<&'static str> {
    if text.contains(['\n', '\r']) {
        return Some("line break");
    }
    if ANSI_ESCAPE.is_match(text) {
        return Some("ANSI escape sequence");
    }
    if text.chars().any(|c| c.is_control() && c != '\t') {
        return Some("control character");
    }
    if FORMAT_STRING.is_match(text) {
        return Some("format string");
    }
    if TEMPLATE.is_match(text) {
        return Some("template expression");
    }
    None
}

/// Render control characters visibly so none reach the sink.
pub fn neutralize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push(' '),
            c if c.is_control() => out.extend(c.escape_unicode()),
            c => out.push(c),
        }
    }
    out
}

/// What gets logged in place of content that tripped [`detect`].
pub fn placeholder(text: &str) -> String {
    let neutral = neutralize(text);
    let mut shown: String = neutral.chars().take(PLACEHOLDER_CHARS).collect();
    if neutral.chars().count() > PLACEHOLDER_CHARS {
        shown.push_str("...");
    }
    format!("{}{}", FILTERED_PREFIX, shown)
}
