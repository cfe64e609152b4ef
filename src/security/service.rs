//! # docguard Security Service
//!
//! The **front door** of the security core. Collaborators never talk to
//! the validator, rate limiter or secure logger directly; they hold an
//! `Arc<SecurityService>` and ask it whether input is safe, whether an
//! operation is over quota, or to log something safely.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  service.rs (you are here)                       │
//! │          Policy overlay: SecurityMode -> FeatureFlags            │
//! ├────────────────┬──────────────────┬──────────────────────────────┤
//! │  validator/    │  rate_limit.rs   │  logger/                     │
//! │  Config text,  │  Token bucket,   │  Redaction, injection        │
//! │  paths, env,   │  windows, block, │  filter, encryption, hash    │
//! │  JSON, argv    │  LRU blacklist   │  chain, NDJSON sink          │
//! ├────────────────┴──────────────────┴──────────────────────────────┤
//! │  events.rs: EventBus -> AuditTrail, FileAuditSink (audit.rs)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Fail closed**: integrity and encryption failures are errors.
//!    Export refuses to run over a chain that does not replay.
//! 2. **Data, not exceptions**: validation and quota outcomes are
//!    returned as values; only policy violations become
//!    [`SecurityError::PolicyViolation`] when the caller asks for one.
//! 3. **Snapshot policy**: every call reads the current [`Policy`] once.
//!    [`SecurityService::update_mode`] swaps it atomically; in-flight
//!    calls finish under the mode they started with.
//! 4. **Observable**: every violation is a [`SecurityEvent`] on the shared
//!    [`EventBus`]. With `audit` on, events also land in a hash-chained
//!    JSONL file.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docguard::security::{SecurityService, SecurityConfig, LogLevel};
//!
//! let service = SecurityService::new(SecurityConfig::default())?;
//! service.initialize();
//!
//! let path = service.validate_file_path("docs/index.md").into_result()?;
//! service.enforce_rate_limit("config_load", "cli")?;
//! service.log(LogLevel::Info, "rendered", None).await?;
//!
//! service.shutdown().await?;
//! ```
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | `../` or encoded traversal in a path | Path validator, canonical root check |
//! | Symlink escaping the root | Canonicalization of the deepest existing ancestor |
//! | Template or script injection in config | Config text signatures |
//! | Prototype pollution via JSON | Dangerous key removal |
//! | Shell injection via argv | Metacharacter rejection |
//! | Forged log lines (CRLF, ANSI) | Injection filter, placeholder |
//! | Secrets in logs | Redaction rules, encryption vault |
//! | Edited or deleted log entries | Hash chain, export verification |
//! | Flooding | Per-operation quotas, block, blacklist |

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::audit::FileAuditSink;
use super::crypto::{AesGcmEncryptor, Encryptor};
use super::error::{Result, SecurityError};
use super::events::{
    AUDIT_TRAIL_CAPACITY, AuditTrail, Auditor, EventBus, EventKind, EventSink, SecurityEvent,
    Severity,
};
use super::logger::{
    ExportFormat, IntegrityReport, LOG_OPERATION, LogLevel, LoggerConfig, SecureLogger, TimeRange,
    redact_pii,
};
use super::mode::{FeatureFlags, SecurityMode};
use super::rate_limit::{
    RateLimitProfile, RateLimitStatus, RateLimiter, SWEEP_INTERVAL, default_profiles,
};
use super::validator::{InputValidator, ValidationResult, ValidatorConfig, strip_control_chars};

/// Prefix marking an encrypted config value.
pub const ENCRYPTED_FIELD_PREFIX: &str = "enc:";

/// Everything needed to assemble a [`SecurityService`].
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    /// Overrides merged over the built-in profiles.
    pub rate_limits: HashMap<String, RateLimitProfile>,
    pub validator: ValidatorConfig,
    pub logging: LoggerConfig,
    /// Hash-chained security event log. Written only while `audit` is on.
    pub audit_log: Option<PathBuf>,
    /// AES-256 key for log and field encryption. Generated if missing.
    pub log_key: Option<PathBuf>,
}

/// The active mode and its feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub mode: SecurityMode,
    pub features: FeatureFlags,
}

impl Policy {
    pub fn for_mode(mode: SecurityMode) -> Self {
        Self {
            mode,
            features: mode.features(),
        }
    }
}

/// Outcome of a consuming quota check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Quota as seen by the next request.
    pub status: RateLimitStatus,
}

impl RateLimitDecision {
    /// `Ok(())` when allowed, otherwise a policy violation with retry-after.
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            return Ok(());
        }
        Err(SecurityError::PolicyViolation {
            retry_after: self.status.retry_after.unwrap_or(self.status.reset_after),
        })
    }
}

/// Point-in-time summary for `docguard status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub mode: SecurityMode,
    pub features: FeatureFlags,
    pub initialized: bool,
    pub rate_limit_keys: usize,
    pub blacklisted_keys: usize,
    pub events_recorded: usize,
    pub log_entries_buffered: usize,
    pub log_file: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub encryption_available: bool,
}

/// Audit file sink that only writes while the policy has `audit` on.
struct GatedAuditSink {
    sink: FileAuditSink,
    enabled: AtomicBool,
}

impl EventSink for GatedAuditSink {
    fn record(&self, event: &SecurityEvent) {
        if self.enabled.load(Ordering::Relaxed) {
            self.sink.record(event);
        }
    }
}

/// Mode-selectable composition of validator, rate limiter and logger.
pub struct SecurityService {
    policy: RwLock<Arc<Policy>>,
    validator: InputValidator,
    limiter: Arc<RateLimiter>,
    logger: Arc<SecureLogger>,
    bus: Arc<EventBus>,
    trail: Arc<AuditTrail>,
    audit: Option<Arc<GatedAuditSink>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    auditor: Auditor,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityService {
    /// Build every component. The log key, if configured, is loaded or
    /// generated here.
    pub fn new(config: SecurityConfig) -> anyhow::Result<Self> {
        let encryptor = match &config.log_key {
            Some(path) => Some(Arc::new(AesGcmEncryptor::from_key_file(path)?) as Arc<dyn Encryptor>),
            None => None,
        };
        Self::build(config, encryptor)
    }

    /// Build with a caller-supplied encryption provider.
    pub fn with_encryptor(
        config: SecurityConfig,
        encryptor: Arc<dyn Encryptor>,
    ) -> anyhow::Result<Self> {
        Self::build(config, Some(encryptor))
    }

    /// In-memory service in the default mode: no files, no encryption key.
    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(SecurityConfig::default())
    }

    fn build(config: SecurityConfig, encryptor: Option<Arc<dyn Encryptor>>) -> anyhow::Result<Self> {
        let policy = Policy::for_mode(config.mode);
        let bus = Arc::new(EventBus::new());

        let trail = Arc::new(AuditTrail::new(AUDIT_TRAIL_CAPACITY));
        bus.register(trail.clone());

        let audit = match &config.audit_log {
            Some(path) => {
                let gated = Arc::new(GatedAuditSink {
                    sink: FileAuditSink::new(path.clone())?,
                    enabled: AtomicBool::new(policy.features.audit),
                });
                bus.register(gated.clone());
                Some(gated)
            }
            None => None,
        };

        let mut profiles = default_profiles();
        profiles.extend(config.rate_limits.clone());
        let log_quota = profiles
            .get(LOG_OPERATION)
            .cloned()
            .unwrap_or_else(|| RateLimitProfile::token_bucket(1_000, 100, 100.0));

        let validator = InputValidator::new(config.validator.clone(), bus.clone());
        validator.set_caching(policy.features.caching);

        let mut logger = SecureLogger::new(config.logging.clone(), log_quota, policy.features, bus.clone())
            .context("Failed to open secure log")?;
        if let Some(encryptor) = &encryptor {
            logger = logger.with_encryptor(encryptor.clone());
        }

        debug!(mode = %policy.mode, "Security service built");

        Ok(Self {
            policy: RwLock::new(Arc::new(policy)),
            validator,
            limiter: Arc::new(RateLimiter::new(profiles, bus.clone())),
            logger: Arc::new(logger),
            auditor: Auditor::new(bus.clone()),
            bus,
            trail,
            audit,
            encryptor,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the rate-limit sweeper and the log flush timer.
    ///
    /// Requires a Tokio runtime. Calling it twice is a no-op.
    pub fn initialize(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.limiter.spawn_sweeper(SWEEP_INTERVAL));
        tasks.push(
            self.logger
                .spawn_flusher(self.logger.config().flush_interval()),
        );
        info!(mode = %self.mode(), "Security service initialized");
    }

    /// Cancel background tasks and flush buffered log entries.
    pub async fn shutdown(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        let flushed = self.logger.flush().await?;
        debug!(flushed, "Security service shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Switch mode. Calls already holding a policy snapshot are unaffected.
    pub fn update_mode(&self, mode: SecurityMode) {
        let next = Policy::for_mode(mode);
        let previous = {
            let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *policy, Arc::new(next))
        };

        self.validator.set_caching(next.features.caching);
        self.logger.set_features(next.features);
        if let Some(audit) = &self.audit {
            audit.enabled.store(next.features.audit, Ordering::Relaxed);
        }

        if previous.mode != mode {
            info!(from = %previous.mode, to = %mode, "Security mode changed");
            self.auditor.record(
                SecurityEvent::new(EventKind::ModeChanged, Severity::Low, "service", mode.as_str())
                    .with_detail(format!("{} -> {}", previous.mode, mode)),
            );
        }
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> Arc<Policy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mode(&self) -> SecurityMode {
        self.policy().mode
    }

    pub fn features(&self) -> FeatureFlags {
        self.policy().features
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate_config_text(&self, text: &str) -> ValidationResult<String> {
        self.validator.validate_config_text(text)
    }

    pub fn validate_file_path(&self, path: &str) -> ValidationResult<PathBuf> {
        self.validator.validate_file_path(path)
    }

    pub fn validate_env_var(&self, key: &str, value: &str) -> ValidationResult<String> {
        self.validator.validate_env_var(key, value)
    }

    pub fn sanitize_object(&self, value: &Value) -> ValidationResult<Value> {
        self.validator.sanitize_object(value)
    }

    pub fn validate_json(&self, text: &str) -> ValidationResult<Value> {
        self.validator.validate_json(text)
    }

    pub fn validate_cli_args(&self, args: &[String]) -> ValidationResult<Vec<String>> {
        self.validator.validate_cli_args(args)
    }

    pub fn sanitize_text(&self, text: &str) -> String {
        self.validator.sanitize_text(text)
    }

    /// Make an error message safe to show or log under the current mode.
    pub fn sanitize_message(&self, message: &str) -> String {
        let features = self.features();
        if !features.sanitize_messages {
            return message.to_string();
        }
        let stripped = strip_control_chars(message, true);
        if features.pii_filtering {
            redact_pii(&stripped).0
        } else {
            stripped
        }
    }

    // ── Rate limiting ───────────────────────────────────────────────

    /// Consume quota. Always allowed while `rate_limiting` is off.
    pub fn check_rate_limit(&self, operation: &str, source: &str) -> RateLimitDecision {
        if !self.features().rate_limiting {
            return RateLimitDecision {
                allowed: true,
                status: self.limiter.status(operation, source),
            };
        }
        let allowed = self.limiter.check_limit(operation, source);
        RateLimitDecision {
            allowed,
            status: self.limiter.status(operation, source),
        }
    }

    /// [`check_rate_limit`](Self::check_rate_limit) as a `Result`.
    pub fn enforce_rate_limit(&self, operation: &str, source: &str) -> Result<()> {
        self.check_rate_limit(operation, source).into_result()
    }

    /// Peek at quota without consuming it.
    pub fn rate_limit_status(&self, operation: &str, source: &str) -> RateLimitStatus {
        self.limiter.status(operation, source)
    }

    // ── Logging ─────────────────────────────────────────────────────

    pub async fn log(&self, level: LogLevel, message: &str, context: Option<Value>) -> Result<()> {
        self.logger.log(level, message, context).await
    }

    pub async fn flush(&self) -> Result<usize> {
        self.logger.flush().await
    }

    pub fn verify_integrity(&self, range: TimeRange) -> Result<IntegrityReport> {
        self.logger.verify_integrity(range)
    }

    pub fn verify_log_file(&self, path: &Path) -> Result<IntegrityReport> {
        self.logger.verify_log_file(path)
    }

    pub fn export(&self, format: ExportFormat, range: TimeRange) -> Result<String> {
        self.logger.export(format, range)
    }

    pub async fn decrypt_entry(&self, reference: &str) -> Result<Value> {
        self.logger.decrypt_entry(reference).await
    }

    // ── Field encryption ────────────────────────────────────────────

    /// True when a field name carries secret material.
    pub fn is_sensitive_field(&self, name: &str) -> bool {
        let keywords = &self.logger.config().sensitive_keywords;
        let lower = name.to_ascii_lowercase();
        keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    /// Encrypt a sensitive field's value when the mode asks for it.
    ///
    /// Non-sensitive fields, already-encrypted values and modes without
    /// `encrypt_sensitive` pass through unchanged.
    pub async fn encrypt_field(&self, name: &str, value: &str) -> Result<String> {
        if !self.features().encrypt_sensitive
            || !self.is_sensitive_field(name)
            || value.starts_with(ENCRYPTED_FIELD_PREFIX)
        {
            return Ok(value.to_string());
        }
        let Some(encryptor) = &self.encryptor else {
            return Err(SecurityError::Encryption(
                "No encryption provider configured".into(),
            ));
        };
        let token = encryptor.encrypt(value.as_bytes()).await?;
        Ok(format!("{}{}", ENCRYPTED_FIELD_PREFIX, token))
    }

    /// Reverse [`encrypt_field`](Self::encrypt_field). Plain values pass through.
    pub async fn decrypt_field(&self, value: &str) -> Result<String> {
        let Some(token) = value.strip_prefix(ENCRYPTED_FIELD_PREFIX) else {
            return Ok(value.to_string());
        };
        let Some(encryptor) = &self.encryptor else {
            return Err(SecurityError::Encryption(
                "No encryption provider configured".into(),
            ));
        };
        let plain = encryptor.decrypt(token).await?;
        String::from_utf8(plain)
            .map_err(|_| SecurityError::Encryption("Decrypted field is not UTF-8".into()))
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        self.bus.register(sink);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SecurityEvent> {
        self.bus.subscribe()
    }

    /// Raise an event on behalf of a façade.
    pub fn record_event(&self, event: SecurityEvent) {
        self.auditor.record(event);
    }

    /// Recent events from every component, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.trail.snapshot()
    }

    pub fn events_of_kind(&self, kind: EventKind) -> Vec<SecurityEvent> {
        self.trail.of_kind(kind)
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn logger(&self) -> &Arc<SecureLogger> {
        &self.logger
    }

    pub fn status(&self) -> ServiceStatus {
        let policy = self.policy();
        ServiceStatus {
            mode: policy.mode,
            features: policy.features,
            initialized: self.is_initialized(),
            rate_limit_keys: self.limiter.tracked_keys(),
            blacklisted_keys: self.limiter.blacklist_len(),
            events_recorded: self.trail.len(),
            log_entries_buffered: self.logger.buffered(),
            log_file: self.logger.file_path().map(Path::to_path_buf),
            audit_log: self.audit.as_ref().map(|a| a.sink.path().to_path_buf()),
            encryption_available: self.encryptor.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit::read_audit_log;
    use crate::security::crypto::MockEncryptor;
    use serde_json::json;

    fn service(mode: SecurityMode) -> SecurityService {
        SecurityService::new(SecurityConfig {
            mode,
            ..SecurityConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn mode_switch_updates_policy_and_components() {
        let svc = service(SecurityMode::Secure);
        let before = svc.policy();
        svc.update_mode(SecurityMode::Optimized);

        assert_eq!(before.mode, SecurityMode::Secure);
        assert_eq!(svc.mode(), SecurityMode::Optimized);
        assert!(svc.logger().features().buffered_io);
        assert_eq!(svc.events_of_kind(EventKind::ModeChanged).len(), 1);

        svc.update_mode(SecurityMode::Optimized);
        assert_eq!(svc.events_of_kind(EventKind::ModeChanged).len(), 1);
    }

    #[test]
    fn rate_limit_decision_becomes_policy_violation() {
        let mut limits = HashMap::new();
        limits.insert(
            "api_call".to_string(),
            RateLimitProfile::fixed_window(60_000, 1),
        );
        let svc = SecurityService::new(SecurityConfig {
            rate_limits: limits,
            ..SecurityConfig::default()
        })
        .unwrap();

        assert!(svc.enforce_rate_limit("api_call", "u1").is_ok());
        let err = svc.enforce_rate_limit("api_call", "u1").unwrap_err();
        assert!(matches!(err, SecurityError::PolicyViolation { .. }));
        assert!(err.to_string().starts_with("Too many requests. Please try again later"));
        assert_eq!(svc.events_of_kind(EventKind::RateLimitExceeded).len(), 1);
    }

    #[test]
    fn events_from_all_components_reach_the_service_trail() {
        let svc = service(SecurityMode::Secure);
        let _ = svc.validate_file_path("../../etc/passwd");
        let _ = svc.validate_cli_args(&["a;b".to_string()]);
        let kinds: Vec<EventKind> = svc.events().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::PathTraversal));
        assert!(kinds.contains(&EventKind::ShellInjection));
    }

    #[tokio::test]
    async fn subscribers_see_logger_events() {
        let svc = service(SecurityMode::Basic);
        let mut rx = svc.subscribe();
        svc.log(LogLevel::Info, "a\r\nforged", None).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::InjectionAttempt);
        assert_eq!(event.source, "logger");
    }

    #[test]
    fn sanitize_message_follows_mode() {
        let svc = service(SecurityMode::Secure);
        assert_eq!(
            svc.sanitize_message("failed for bob@example.com\x07"),
            "failed for [REDACTED_EMAIL]"
        );
        svc.update_mode(SecurityMode::Optimized);
        assert_eq!(
            svc.sanitize_message("failed for bob@example.com"),
            "failed for bob@example.com"
        );
    }

    #[tokio::test]
    async fn sensitive_fields_round_trip_through_provider() {
        let mut mock = MockEncryptor::new();
        mock.expect_encrypt()
            .returning(|plain| Ok(format!("X{}", String::from_utf8_lossy(plain))));
        mock.expect_decrypt()
            .returning(|token| Ok(token.trim_start_matches('X').as_bytes().to_vec()));
        let svc = SecurityService::with_encryptor(SecurityConfig::default(), Arc::new(mock)).unwrap();

        let sealed = svc.encrypt_field("api_key", "abc123").await.unwrap();
        assert_eq!(sealed, "enc:Xabc123");
        assert_eq!(svc.decrypt_field(&sealed).await.unwrap(), "abc123");
        assert_eq!(svc.encrypt_field("title", "Guide").await.unwrap(), "Guide");
        assert_eq!(svc.decrypt_field("plain").await.unwrap(), "plain");
    }

    #[tokio::test]
    async fn encrypted_field_without_provider_fails_closed() {
        let svc = service(SecurityMode::Secure);
        assert!(svc.encrypt_field("password", "x").await.is_err());
        assert!(svc.decrypt_field("enc:abc").await.is_err());
    }

    #[tokio::test]
    async fn audit_file_follows_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let audit_path = tmp.path().join("audit.jsonl");
        let svc = SecurityService::new(SecurityConfig {
            mode: SecurityMode::Basic,
            audit_log: Some(audit_path.clone()),
            ..SecurityConfig::default()
        })
        .unwrap();

        let _ = svc.validate_json(r#"{"__proto__": 1}"#);
        assert!(read_audit_log(&audit_path).unwrap().is_empty());

        svc.update_mode(SecurityMode::Secure);
        let _ = svc.validate_json(r#"{"__proto__": 1}"#);
        let records = read_audit_log(&audit_path).unwrap();
        assert!(
            records
                .iter()
                .any(|r| r.event.kind == EventKind::PrototypePollution)
        );
    }

    #[tokio::test]
    async fn initialize_and_shutdown_flush_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("app.jsonl");
        let svc = SecurityService::new(SecurityConfig {
            mode: SecurityMode::Enterprise,
            logging: LoggerConfig {
                file: Some(log.to_string_lossy().into_owned()),
                ..LoggerConfig::default()
            },
            ..SecurityConfig::default()
        })
        .unwrap();

        svc.initialize();
        svc.initialize();
        assert!(svc.is_initialized());

        svc.log(LogLevel::Info, "queued", Some(json!({"n": 1}))).await.unwrap();
        assert_eq!(svc.status().log_entries_buffered, 1);

        svc.shutdown().await.unwrap();
        assert!(!svc.is_initialized());
        assert_eq!(svc.verify_log_file(&log).unwrap().checked, 1);
    }
}
