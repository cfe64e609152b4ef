//! Compiled detection patterns shared by the validators.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::security::events::{EventKind, Severity};

/// A named injection signature for config text.
pub(super) struct Signature {
    pub regex: &'static Lazy<Regex>,
    pub kind: EventKind,
    pub severity: Severity,
    pub message: &'static str,
}

static TEMPLATE_INTERPOLATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{[^}]*\}|\{\{[^}]*\}\}|<%[^%]*%>").expect("valid regex"));

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*/?\s*script\b|javascript\s*:").expect("valid regex"));

static EVENT_HANDLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bon(?:load|unload|error|abort|click|dblclick|mouse\w+|key\w+|focus|blur|change|input|submit|reset|select|drag\w*|drop|pointer\w+|toggle|animation\w+|transition\w+)\s*=",
    )
    .expect("valid regex")
});

static PROTOTYPE_POLLUTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"__proto__|\bconstructor\s*[.\[]\s*['"]?prototype|\bprototype\s*[.\[]|(?m)^\s*-?\s*['"]?(?:constructor|prototype)['"]?\s*:"#,
    )
    .expect("valid regex")
});

static DYNAMIC_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\beval\s*\(|\bnew\s+Function\b|\bFunction\s*\(|\bset(?:Timeout|Interval|Immediate)\s*\(|\bexecScript\s*\(|!!(?:js|python)/",
    )
    .expect("valid regex")
});

static PROCESS_ACCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bprocess\s*\.\s*(?:env|exit|kill|binding|mainModule|argv|dlopen)\b|\brequire\s*\(|\bchild_process\b|\bimport\s*\(",
    )
    .expect("valid regex")
});

pub(super) static CONFIG_SIGNATURES: [Signature; 6] = [
    Signature {
        regex: &TEMPLATE_INTERPOLATION,
        kind: EventKind::ConfigInjection,
        severity: Severity::High,
        message: "Template interpolation syntax detected",
    },
    Signature {
        regex: &SCRIPT_TAG,
        kind: EventKind::ScriptInjection,
        severity: Severity::High,
        message: "Script content detected",
    },
    Signature {
        regex: &EVENT_HANDLER,
        kind: EventKind::ScriptInjection,
        severity: Severity::High,
        message: "Event handler attribute detected",
    },
    Signature {
        regex: &PROTOTYPE_POLLUTION,
        kind: EventKind::PrototypePollution,
        severity: Severity::High,
        message: "Prototype pollution key detected",
    },
    Signature {
        regex: &DYNAMIC_CODE,
        kind: EventKind::ConfigInjection,
        severity: Severity::High,
        message: "Dynamic code execution detected",
    },
    Signature {
        regex: &PROCESS_ACCESS,
        kind: EventKind::ConfigInjection,
        severity: Severity::High,
        message: "Process access reference detected",
    },
];

pub(super) static ENV_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

pub(super) static OVERLONG_UTF8: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)%c0%ae|%c0%af|%c1%9c|%c1%1c|%e0%80%ae").expect("valid regex"));

/// Keys that must never reach an object merge.
pub(super) const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Characters with special meaning to POSIX and Windows shells.
pub(super) const SHELL_METACHARACTERS: &[char] =
    &[';', '&', '|', '`', '$', '<', '>', '(', ')', '{', '}', '\\', '!'];

/// Exact keys owned by the OS, loader, or language runtimes.
pub(super) const RESERVED_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "PWD",
    "IFS",
    "PS1",
    "PS4",
    "TERM",
    "TMPDIR",
    "LANG",
    "ENV",
    "BASH_ENV",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PERL5OPT",
    "RUBYOPT",
];

pub(super) const RESERVED_ENV_PREFIXES: &[&str] = &["LD_", "DYLD_", "BASH_FUNC_", "SYSTEMD_"];

/// Remove control characters. `\n` and `\t` survive when `keep_whitespace` is set.
pub fn strip_control_chars(input: &str, keep_whitespace: bool) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || (keep_whitespace && (*c == '\n' || *c == '\t')))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_match_known_payloads() {
        let cases = [
            ("name: ${process.env.SECRET}", 0),
            ("desc: <script>alert(1)</script>", 1),
            ("img: <img onerror=alert(1)>", 2),
            ("__proto__: {admin: true}", 3),
            ("x: eval(atob('...'))", 4),
            ("x: require('child_process')", 5),
        ];
        for (text, idx) in cases {
            assert!(
                CONFIG_SIGNATURES[idx].regex.is_match(text),
                "{} should match {}",
                text,
                CONFIG_SIGNATURES[idx].message
            );
        }
    }

    #[test]
    fn benign_config_matches_nothing() {
        let text = "title: Project docs\nonline: true\nfunctions:\n  - name: parse\n";
        for sig in &CONFIG_SIGNATURES {
            assert!(!sig.regex.is_match(text), "false positive: {}", sig.message);
        }
    }

    #[test]
    fn strip_control_keeps_layout_whitespace() {
        assert_eq!(strip_control_chars("a\n\tb\x00\x1b", true), "a\n\tb");
        assert_eq!(strip_control_chars("a\n\tb", false), "ab");
    }
}
