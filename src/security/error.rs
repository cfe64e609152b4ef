//! Error taxonomy for the security core.
//!
//! Validation and rate-limit outcomes are ordinary data
//! ([`ValidationResult`](super::ValidationResult),
//! [`RateLimitStatus`](super::RateLimitStatus)) and never surface here.
//! This type carries the failures that must fail closed.

use std::time::Duration;

/// Failures raised by the security core.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// Rate limit exceeded or source blacklisted.
    #[error("Too many requests. Please try again later (retry after {}s).", retry_after.as_secs().max(1))]
    PolicyViolation { retry_after: Duration },

    /// One or more violations detected; the complete list is carried.
    #[error("Validation failed: {}", .0.join("; "))]
    ValidationFailure(Vec<String>),

    /// Hash-chain mismatch on verify or export.
    #[error("Log integrity verification failed at entry {sequence}: tampering suspected ({reason})")]
    IntegrityFailure { sequence: u64, reason: String },

    /// Encryption provider failure.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl SecurityError {
    /// True for failures that indicate the log can no longer be trusted.
    pub fn is_tampering(&self) -> bool {
        matches!(self, SecurityError::IntegrityFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_violation_message_is_generic() {
        let err = SecurityError::PolicyViolation {
            retry_after: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains("try again later"));
        assert!(msg.contains("retry after 1s"));
    }

    #[test]
    fn integrity_failure_mentions_tampering() {
        let err = SecurityError::IntegrityFailure {
            sequence: 7,
            reason: "hash mismatch".to_string(),
        };
        assert!(err.is_tampering());
        assert!(err.to_string().contains("tampering suspected"));
    }

    #[test]
    fn validation_failure_lists_all_reasons() {
        let err = SecurityError::ValidationFailure(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Validation failed: a; b");
    }
}
