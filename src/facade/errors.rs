use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::security::{EventKind, LogLevel, SecurityEvent, SecurityService, Severity};

/// Rate-limit operation for error reports, keyed by error kind.
pub const ERROR_OPERATION: &str = "error_generation";

/// A failure after sanitization, ready to show or persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandledError {
    pub kind: String,
    pub message: String,
    /// Cause chain, kept only in modes that retain stack traces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
    /// True when the report was dropped by the error quota.
    pub suppressed: bool,
}

/// Sanitizes, rate-limits and audits application errors.
pub struct ErrorHandler {
    service: Arc<SecurityService>,
}

impl ErrorHandler {
    pub fn new(service: Arc<SecurityService>) -> Self {
        Self { service }
    }

    /// Report an error of the given kind.
    ///
    /// Every report is sanitized. Reports within quota also raise an
    /// `error_handled` event and a secure log entry; reports over quota
    /// are marked suppressed and go nowhere else.
    pub async fn handle(&self, kind: &str, error: &anyhow::Error) -> HandledError {
        let policy = self.service.policy();
        let message = self.service.sanitize_message(&error.to_string());
        let trace = policy.features.keep_stack_traces.then(|| {
            error
                .chain()
                .skip(1)
                .map(|cause| self.service.sanitize_message(&cause.to_string()))
                .collect()
        });

        if !self.service.check_rate_limit(ERROR_OPERATION, kind).allowed {
            debug!(kind, "Error report suppressed by quota");
            return HandledError {
                kind: kind.to_string(),
                message,
                trace,
                suppressed: true,
            };
        }

        self.service.record_event(
            SecurityEvent::new(EventKind::ErrorHandled, Severity::Low, "error_handler", &message)
                .with_detail(kind),
        );

        let context = json!({ "kind": kind, "trace": trace });
        if let Err(e) = self
            .service
            .log(LogLevel::Error, &message, Some(context))
            .await
        {
            debug!("Failed to persist error report: {}", e);
        }

        HandledError {
            kind: kind.to_string(),
            message,
            trace,
            suppressed: false,
        }
    }

    /// One-line text for the end user.
    pub fn user_message(&self, handled: &HandledError) -> String {
        match &handled.trace {
            Some(trace) if !trace.is_empty() => {
                format!("{}: {} (caused by: {})", handled.kind, handled.message, trace.join(": "))
            }
            _ => format!("{}: {}", handled.kind, handled.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{RateLimitProfile, SecurityConfig, SecurityMode};
    use anyhow::Context;
    use std::collections::HashMap;

    fn handler(mode: SecurityMode, quota: Option<RateLimitProfile>) -> ErrorHandler {
        let mut rate_limits = HashMap::new();
        if let Some(quota) = quota {
            rate_limits.insert(ERROR_OPERATION.to_string(), quota);
        }
        let service = SecurityService::new(SecurityConfig {
            mode,
            rate_limits,
            ..SecurityConfig::default()
        })
        .unwrap();
        ErrorHandler::new(Arc::new(service))
    }

    fn nested_error() -> anyhow::Error {
        Err::<(), _>(anyhow::anyhow!("permission denied for /home/alice/notes"))
            .context("Failed to render alice@example.com's page")
            .unwrap_err()
    }

    #[tokio::test]
    async fn message_and_trace_are_sanitized() {
        let h = handler(SecurityMode::Basic, None);
        let handled = h.handle("render", &nested_error()).await;

        assert_eq!(handled.message, "Failed to render [REDACTED_EMAIL]'s page");
        assert_eq!(
            handled.trace,
            Some(vec!["permission denied for /home/[USER]/notes".to_string()])
        );
        assert!(!handled.suppressed);
        assert!(h.user_message(&handled).contains("caused by"));
    }

    #[tokio::test]
    async fn traces_dropped_in_production_modes() {
        let h = handler(SecurityMode::Secure, None);
        let handled = h.handle("render", &nested_error()).await;
        assert!(handled.trace.is_none());
        assert_eq!(
            h.service.events_of_kind(EventKind::ErrorHandled).len(),
            1
        );
    }

    #[tokio::test]
    async fn quota_is_per_error_kind() {
        let h = handler(
            SecurityMode::Basic,
            Some(RateLimitProfile::fixed_window(60_000, 2)),
        );
        let err = anyhow::anyhow!("boom");
        let mut suppressed = 0;
        for _ in 0..4 {
            if h.handle("io", &err).await.suppressed {
                suppressed += 1;
            }
        }
        assert_eq!(suppressed, 2);
        assert!(!h.handle("parse", &err).await.suppressed);
        assert_eq!(h.service.events_of_kind(EventKind::ErrorHandled).len(), 3);
    }
}
