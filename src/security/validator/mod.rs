//! Input validation and sanitization against injection and traversal.
//!
//! One entry point per input class, each returning a
//! [`ValidationResult`]:
//!
//! | Input | Method | Violation severity |
//! |-------|--------|--------------------|
//! | Config text | [`InputValidator::validate_config_text`] | high |
//! | File path | [`InputValidator::validate_file_path`] | critical |
//! | Environment variable | [`InputValidator::validate_env_var`] | medium |
//! | Object / JSON | [`InputValidator::sanitize_object`], [`InputValidator::validate_json`] | high |
//! | CLI arguments | [`InputValidator::validate_cli_args`] | high |
//!
//! Every detected violation is recorded as a [`SecurityEvent`]. Errors
//! are complete lists; an invalid result never carries a partially
//! sanitized value.

mod args;
mod config_text;
mod env;
mod object;
mod path;
mod patterns;

pub use object::escape_html;
pub use patterns::strip_control_chars;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::error::SecurityError;
use super::events::{Auditor, EventBus, EventKind, SecurityEvent, Severity};
use path::PathCache;

/// Outcome of one validation call.
///
/// `is_valid()` is derived from `errors()` and cannot disagree with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult<T> {
    is_valid: bool,
    sanitized_value: Option<T>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl<T> ValidationResult<T> {
    /// Build a result; the sanitized value is discarded when any error exists.
    pub fn new(sanitized: T, errors: Vec<String>, warnings: Vec<String>) -> Self {
        let is_valid = errors.is_empty();
        Self {
            is_valid,
            sanitized_value: if is_valid { Some(sanitized) } else { None },
            errors,
            warnings,
        }
    }

    pub fn invalid(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            sanitized_value: None,
            errors,
            warnings,
        }
    }

    pub fn valid(sanitized: T) -> Self {
        Self::new(sanitized, Vec::new(), Vec::new())
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn sanitized_value(&self) -> Option<&T> {
        self.sanitized_value.as_ref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Convert into a `Result`, carrying all errors on failure.
    pub fn into_result(self) -> Result<T, SecurityError> {
        match self.sanitized_value {
            Some(value) if self.is_valid => Ok(value),
            _ => Err(SecurityError::ValidationFailure(self.errors)),
        }
    }
}

/// Validator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum bytes of config text or JSON accepted.
    #[serde(default = "default_max_config_length")]
    pub max_config_length: usize,

    /// Maximum nesting depth for config text and objects.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    #[serde(default = "default_max_env_value_length")]
    pub max_env_value_length: usize,

    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,

    /// Directory every validated path must resolve under.
    /// Defaults to the working directory.
    #[serde(default)]
    pub allowed_root: Option<String>,

    /// Directory names (any component) or absolute prefixes that are never accessible.
    #[serde(default = "default_sensitive_dirs")]
    pub sensitive_dirs: Vec<String>,

    #[serde(default = "default_path_cache_size")]
    pub path_cache_size: usize,
}

fn default_max_config_length() -> usize {
    1_048_576 // 1MB
}
fn default_max_nesting_depth() -> usize {
    10
}
fn default_max_env_value_length() -> usize {
    32_768
}
fn default_max_path_length() -> usize {
    4096
}
fn default_path_cache_size() -> usize {
    1000
}
fn default_sensitive_dirs() -> Vec<String> {
    [
        ".ssh", ".aws", ".gnupg", ".kube", ".docker", ".git", "/etc", "/proc", "/sys", "/dev",
        "/root", "/boot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_config_length: default_max_config_length(),
            max_nesting_depth: default_max_nesting_depth(),
            max_env_value_length: default_max_env_value_length(),
            max_path_length: default_max_path_length(),
            allowed_root: None,
            sensitive_dirs: default_sensitive_dirs(),
            path_cache_size: default_path_cache_size(),
        }
    }
}

/// Validates and sanitizes untrusted input.
pub struct InputValidator {
    config: ValidatorConfig,
    root: PathBuf,
    cache: Mutex<PathCache>,
    caching: AtomicBool,
    auditor: Auditor,
}

impl InputValidator {
    pub fn new(config: ValidatorConfig, bus: Arc<EventBus>) -> Self {
        let root = path::resolve_root(config.allowed_root.as_deref());
        let cache = Mutex::new(PathCache::new(config.path_cache_size));
        Self {
            config,
            root,
            cache,
            caching: AtomicBool::new(true),
            auditor: Auditor::new(bus),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// The directory every validated path must stay under.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Enable or disable the valid-path cache. Disabling clears it.
    pub fn set_caching(&self, enabled: bool) {
        self.caching.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    /// Escape and strip control characters from free text.
    ///
    /// Idempotent: already-escaped entities are left alone.
    pub fn sanitize_text(&self, input: &str) -> String {
        escape_html(&strip_control_chars(input, true))
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    fn report(&self, kind: EventKind, severity: Severity, input: &str, detail: &str) {
        self.auditor
            .record(SecurityEvent::new(kind, severity, "validator", input).with_detail(detail));
    }
}

#[cfg(test)]
pub(crate) fn test_validator(root: &std::path::Path) -> InputValidator {
    let config = ValidatorConfig {
        allowed_root: Some(root.to_string_lossy().into_owned()),
        ..ValidatorConfig::default()
    };
    InputValidator::new(config, Arc::new(EventBus::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_validity_tracks_errors() {
        let ok: ValidationResult<u8> = ValidationResult::new(1, vec![], vec!["w".into()]);
        assert!(ok.is_valid());
        assert_eq!(ok.sanitized_value(), Some(&1));

        let bad: ValidationResult<u8> = ValidationResult::new(1, vec!["e".into()], vec![]);
        assert!(!bad.is_valid());
        assert_eq!(bad.sanitized_value(), None);
        assert!(matches!(
            bad.into_result(),
            Err(SecurityError::ValidationFailure(errs)) if errs == vec!["e".to_string()]
        ));
    }

    #[test]
    fn sanitize_text_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let validator = test_validator(tmp.path());
        let inputs = [
            "<script>alert('x')</script>",
            "Tom & Jerry \"quoted\"",
            "already &amp; escaped &lt;b&gt;",
            "bell\x07 and\x1b[31m red",
        ];
        for input in inputs {
            let once = validator.sanitize_text(input);
            let twice = validator.sanitize_text(&once);
            assert_eq!(once, twice, "input: {:?}", input);
        }
    }
}
