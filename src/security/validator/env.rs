use super::patterns::{ENV_KEY, RESERVED_ENV_KEYS, RESERVED_ENV_PREFIXES, SHELL_METACHARACTERS};
use super::{InputValidator, ValidationResult};
use crate::security::events::{EventKind, Severity};

const MAX_ENV_KEY_LENGTH: usize = 256;

impl InputValidator {
    /// Validate an environment variable assignment.
    ///
    /// Reserved keys only warn; the value is returned with shell
    /// metacharacters and control characters removed.
    pub fn validate_env_var(&self, key: &str, value: &str) -> ValidationResult<String> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if key.len() > MAX_ENV_KEY_LENGTH {
            errors.push(format!(
                "Environment variable name exceeds {} characters",
                MAX_ENV_KEY_LENGTH
            ));
        } else if !ENV_KEY.is_match(key) {
            errors.push(format!("Invalid environment variable name: {}", key.escape_debug()));
        } else if is_reserved(key) {
            warnings.push(format!("Environment variable {} is reserved by the system", key));
        }

        if value.len() > self.config.max_env_value_length {
            errors.push(format!(
                "Environment variable value exceeds maximum length of {} bytes",
                self.config.max_env_value_length
            ));
        }

        for error in &errors {
            self.report(EventKind::EnvVarViolation, Severity::Medium, key, error);
        }
        for warning in &warnings {
            self.report(EventKind::EnvVarViolation, Severity::Low, key, warning);
        }
        if !errors.is_empty() {
            return ValidationResult::invalid(errors, warnings);
        }

        let sanitized: String = value
            .chars()
            .filter(|c| !c.is_control() && !SHELL_METACHARACTERS.contains(c))
            .collect();
        if sanitized != value {
            warnings.push(format!(
                "Removed shell metacharacters or control characters from {}",
                key
            ));
            self.report(
                EventKind::Sanitization,
                Severity::Medium,
                value,
                &format!("value of {} sanitized", key),
            );
        }

        ValidationResult::new(sanitized, errors, warnings)
    }
}

fn is_reserved(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    RESERVED_ENV_KEYS.contains(&upper.as_str())
        || RESERVED_ENV_PREFIXES.iter().any(|p| upper.starts_with(p))
}
