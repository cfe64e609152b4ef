//! Security-hardening core for docguard.
//!
//! See [`service`] for the module overview, architecture diagram,
//! and public API documentation.

pub mod audit;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod events;
pub mod logger;
pub mod mode;
pub mod rate_limit;
pub mod service;
pub mod validator;

pub use self::audit::{AuditRecord, FileAuditSink, read_audit_log, verify_audit_chain};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::crypto::{AesGcmEncryptor, Encryptor, ensure_log_key, read_log_key};
pub use self::error::{Result, SecurityError};
pub use self::events::{AuditTrail, EventBus, EventKind, EventSink, SecurityEvent, Severity};
pub use self::logger::{
    ExportFormat, IntegrityReport, LogLevel, LoggerConfig, SecureLogEntry, SecureLogger,
    TimeRange, read_entries as read_log_entries, verify_log_file,
};
pub use self::mode::{FeatureFlags, SecurityMode};
pub use self::rate_limit::{
    Algorithm, RateLimitEntry, RateLimitProfile, RateLimitStatus, RateLimiter, default_profiles,
};
pub use self::service::{
    Policy, RateLimitDecision, SecurityConfig, SecurityService, ServiceStatus,
};
pub use self::validator::{InputValidator, ValidationResult, ValidatorConfig};
