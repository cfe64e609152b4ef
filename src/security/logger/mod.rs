//! Tamper-evident, PII-redacted application log.
//!
//! Every call to [`SecureLogger::log`] runs the same pipeline:
//!
//! 1. **Quota**: the logger's own [`RateLimiter`], operation `logging`,
//!    keyed by level. Error and critical entries bypass it unless
//!    `rate_limit_severe` is set.
//! 2. **Structure**: message truncation, context depth bound, sensitive
//!    context keys masked.
//! 3. **Injection**: line breaks, control characters, ANSI escapes,
//!    format strings and template syntax divert the original to an
//!    `injection_attempt` event; a neutralized placeholder is logged.
//! 4. **PII**: ordered redaction rules.
//! 5. **Encryption**: severe or sensitive entries are sealed; only
//!    `[ENCRYPTED]` and a vault reference stay in plaintext.
//! 6. **Integrity**: sequence and chain hash are assigned under the state
//!    mutex, so chain order is call order.
//! 7. **Write**: buffered or immediate. Flushes drain the buffer in order
//!    behind a single write gate.
//!
//! Which stages run is decided by the [`FeatureFlags`] snapshot taken when
//! the call starts.

mod anomaly;
mod entry;
mod injection;
mod integrity;
mod redact;
mod sink;

pub use anomaly::Anomaly;
pub use entry::{ExportFormat, LogLevel, SecureLogEntry, TimeRange, VaultRecord};
pub use integrity::{GENESIS_HASH, entry_hash, verify_chain};
pub use redact::redact as redact_pii;
pub use sink::{FileSink, read_entries, rotated_path};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::crypto::Encryptor;
use super::error::{Result, SecurityError};
use super::events::{Auditor, EventBus, EventKind, SecurityEvent, Severity};
use super::mode::FeatureFlags;
use super::rate_limit::{RateLimitProfile, RateLimiter};
use super::validator::strip_control_chars;
use anomaly::AnomalyDetector;

/// Rate-limit operation name for log volume.
pub const LOG_OPERATION: &str = "logging";

/// Plaintext stand-in for sealed content.
pub const ENCRYPTED_PLACEHOLDER: &str = "[ENCRYPTED]";

/// Logger settings (the `[logging]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Minimum level recorded.
    #[serde(default)]
    pub level: LogLevel,

    /// NDJSON log file. In-memory only when unset.
    #[serde(default)]
    pub file: Option<String>,

    /// Rotate once the file reaches this size.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Entries held before a buffered flush.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Characters kept from a message or context string.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    #[serde(default = "default_max_context_depth")]
    pub max_context_depth: usize,

    /// Entries kept in memory for verification and export.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Apply the quota to error and critical entries as well.
    #[serde(default)]
    pub rate_limit_severe: bool,

    /// Substrings marking a context key or message as sensitive.
    #[serde(default = "default_sensitive_keywords")]
    pub sensitive_keywords: Vec<String>,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}
fn default_buffer_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_max_message_length() -> usize {
    10_000
}
fn default_max_context_depth() -> usize {
    5
}
fn default_history_capacity() -> usize {
    10_000
}
fn default_sensitive_keywords() -> Vec<String> {
    [
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "apikey",
        "private_key",
        "credential",
        "authorization",
        "cookie",
        "ssn",
        "credit_card",
        "card_number",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            file: None,
            max_file_bytes: default_max_file_bytes(),
            buffer_size: default_buffer_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_message_length: default_max_message_length(),
            max_context_depth: default_max_context_depth(),
            history_capacity: default_history_capacity(),
            rate_limit_severe: false,
            sensitive_keywords: default_sensitive_keywords(),
        }
    }
}

impl LoggerConfig {
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .map(|f| PathBuf::from(shellexpand::tilde(f).into_owned()))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Outcome of a successful chain replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Entries inside the requested range that were verified.
    pub checked: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// False when the replay had to trust its first entry because the
    /// predecessor lives in a rotated file.
    pub anchored: bool,
}

struct LogState {
    next_sequence: u64,
    last_hash: String,
    buffer: Vec<SecureLogEntry>,
    pending_vault: Vec<VaultRecord>,
    history: VecDeque<SecureLogEntry>,
    /// Chain hash preceding the oldest hashed entry in `history`.
    history_anchor: String,
    vault: HashMap<String, VaultRecord>,
    anomaly: AnomalyDetector,
}

impl LogState {
    fn remember(&mut self, entry: SecureLogEntry, capacity: usize) {
        while self.history.len() >= capacity.max(1) {
            let Some(old) = self.history.pop_front() else {
                break;
            };
            if let Some(hash) = old.integrity_hash {
                self.history_anchor = hash;
            }
            if let Some(reference) = old.encrypted_ref {
                self.vault.remove(&reference);
            }
        }
        self.history.push_back(entry);
    }
}

/// The audited application log.
pub struct SecureLogger {
    config: LoggerConfig,
    features: RwLock<FeatureFlags>,
    limiter: RateLimiter,
    encryptor: Option<Arc<dyn Encryptor>>,
    sink: Option<FileSink>,
    state: Mutex<LogState>,
    write_gate: tokio::sync::Mutex<()>,
    auditor: Auditor,
}

impl SecureLogger {
    /// Build a logger. When a file is configured, the chain resumes from
    /// the last entry already in it.
    pub fn new(
        config: LoggerConfig,
        quota: RateLimitProfile,
        features: FeatureFlags,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let sink = match config.file_path() {
            Some(path) => Some(FileSink::new(path, config.max_file_bytes)?),
            None => None,
        };

        let (next_sequence, last_hash) = match &sink {
            Some(sink) => resume_point(sink.path()),
            None => (0, GENESIS_HASH.to_string()),
        };

        let mut profiles = HashMap::new();
        profiles.insert(LOG_OPERATION.to_string(), quota);

        Ok(Self {
            limiter: RateLimiter::new(profiles, bus.clone()),
            features: RwLock::new(features),
            encryptor: None,
            sink,
            state: Mutex::new(LogState {
                next_sequence,
                history_anchor: last_hash.clone(),
                last_hash,
                buffer: Vec::new(),
                pending_vault: Vec::new(),
                history: VecDeque::new(),
                vault: HashMap::new(),
                anomaly: AnomalyDetector::new(),
            }),
            write_gate: tokio::sync::Mutex::new(()),
            auditor: Auditor::new(bus),
            config,
        })
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn features(&self) -> FeatureFlags {
        *self.features.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the feature set. Calls already past their snapshot are unaffected.
    pub fn set_features(&self, features: FeatureFlags) {
        *self.features.write().unwrap_or_else(PoisonError::into_inner) = features;
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.path())
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Record one entry. Entries dropped by level or quota return `Ok(())`.
    pub async fn log(&self, level: LogLevel, message: &str, context: Option<Value>) -> Result<()> {
        let features = self.features();
        if level < self.config.level {
            return Ok(());
        }
        if features.rate_limiting
            && (self.config.rate_limit_severe || !level.is_severe())
            && !self.limiter.check_limit(LOG_OPERATION, level.as_str())
        {
            debug!(level = level.as_str(), "Log entry dropped by quota");
            return Ok(());
        }

        let keywords = &self.config.sensitive_keywords;
        let max_len = self.config.max_message_length;
        let mut message = redact::truncate(message, max_len);
        let mut context = context.map(|c| {
            redact::sanitize_context(&c, 0, self.config.max_context_depth, max_len, keywords)
        });
        let mut filtered = false;

        if features.injection_prevention {
            if let Some(pattern) = injection::detect(&message) {
                self.auditor.record(
                    SecurityEvent::new(EventKind::InjectionAttempt, Severity::High, "logger", &message)
                        .with_detail(format!("{} in message", pattern)),
                );
                message = injection::placeholder(&message);
                filtered = true;
            }
            if let Some(ctx) = &context {
                let mut found = None;
                let clean = redact::map_strings(ctx, &mut |s| match injection::detect(s) {
                    Some(pattern) => {
                        found.get_or_insert((pattern, s.to_string()));
                        injection::neutralize(s)
                    }
                    None => s.to_string(),
                });
                if let Some((pattern, original)) = found {
                    self.auditor.record(
                        SecurityEvent::new(
                            EventKind::InjectionAttempt,
                            Severity::High,
                            "logger",
                            &original,
                        )
                        .with_detail(format!("{} in context", pattern)),
                    );
                    context = Some(clean);
                    filtered = true;
                }
            }
        } else if features.sanitize_messages {
            message = strip_control_chars(&message, true);
        }

        if features.pii_filtering {
            let (redacted, hit) = redact::redact(&message);
            message = redacted;
            filtered |= hit;
            if let Some(ctx) = &context {
                let (redacted, hit) = redact::redact_value(ctx);
                context = Some(redacted);
                filtered |= hit;
            }
        }

        let mut encrypted_ref = None;
        let mut sealed = None;
        if features.encrypt_sensitive
            && let Some(encryptor) = &self.encryptor
            && (level.is_severe() || self.mentions_sensitive(&message, context.as_ref()))
        {
            let payload = serde_json::to_vec(&json!({ "message": message, "context": context }))?;
            let ciphertext = encryptor.encrypt(&payload).await?;
            let reference = Uuid::new_v4().to_string();
            sealed = Some((reference.clone(), ciphertext));
            message = ENCRYPTED_PLACEHOLDER.to_string();
            context = None;
            encrypted_ref = Some(reference);
        }

        let (anomalies, flush_now) = {
            let mut state = self.lock();
            let mut entry = SecureLogEntry {
                sequence: state.next_sequence,
                timestamp: Utc::now(),
                level,
                message,
                context,
                filtered,
                correlation_id: Uuid::new_v4().to_string(),
                encrypted_ref,
                unchained: !features.integrity,
                integrity_hash: None,
            };
            if features.integrity {
                let hash = entry_hash(&entry, &state.last_hash)?;
                entry.integrity_hash = Some(hash.clone());
                state.last_hash = hash;
            }
            state.next_sequence += 1;

            if let Some((reference, ciphertext)) = sealed {
                let record = VaultRecord {
                    reference: reference.clone(),
                    sequence: entry.sequence,
                    ciphertext,
                };
                state.vault.insert(reference, record.clone());
                state.pending_vault.push(record);
            }

            let anomalies = if features.anomaly_detection {
                state.anomaly.observe(&entry)
            } else {
                Vec::new()
            };

            state.remember(entry.clone(), self.config.history_capacity);
            state.buffer.push(entry);
            let flush_now = !features.buffered_io || state.buffer.len() >= self.config.buffer_size;
            (anomalies, flush_now)
        };

        for anomaly in anomalies {
            let severity = match anomaly {
                Anomaly::ErrorRate { .. } => Severity::High,
                Anomaly::RepeatedMessage { .. } => Severity::Medium,
            };
            let description = anomaly.describe();
            self.auditor.record(
                SecurityEvent::new(EventKind::Anomaly, severity, "logger", &description)
                    .with_detail(description.clone()),
            );
        }

        if flush_now {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write all buffered entries. Returns the number drained.
    ///
    /// On a sink failure the batch is put back at the front of the buffer.
    pub async fn flush(&self) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let (batch, vault) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.buffer),
                std::mem::take(&mut state.pending_vault),
            )
        };
        let count = batch.len();
        let Some(sink) = &self.sink else {
            return Ok(count);
        };
        if batch.is_empty() && vault.is_empty() {
            return Ok(0);
        }

        // Vault first: a persisted reference always has its ciphertext.
        if !vault.is_empty()
            && let Err(e) = sink.append_vault(vault.clone()).await
        {
            self.requeue(batch, vault);
            return Err(e);
        }
        if let Err(e) = sink.append(batch.clone()).await {
            self.requeue(batch, Vec::new());
            return Err(e);
        }
        Ok(count)
    }

    /// Run [`flush`](Self::flush) every `every` until the handle is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                if let Err(e) = logger.flush().await {
                    warn!("Periodic log flush failed: {}", e);
                }
            }
        })
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    /// In-memory entries whose timestamp falls in `range`.
    pub fn entries(&self, range: TimeRange) -> Vec<SecureLogEntry> {
        self.lock()
            .history
            .iter()
            .filter(|e| range.contains(e.timestamp))
            .cloned()
            .collect()
    }

    /// Replay the chain up to the end of `range`.
    ///
    /// Replay always starts at the oldest retained entry, so a mismatch
    /// anywhere before the range end fails the call. Entries logged while
    /// chaining was off are skipped.
    pub fn verify_integrity(&self, range: TimeRange) -> Result<IntegrityReport> {
        let (history, anchor, head) = {
            let state = self.lock();
            (
                state.history.iter().cloned().collect::<Vec<_>>(),
                state.history_anchor.clone(),
                state.last_hash.clone(),
            )
        };
        let replay: Vec<&SecureLogEntry> = history
            .iter()
            .take_while(|e| !range.is_after(e.timestamp))
            .collect();

        let outcome = verify_chain(replay.iter().copied(), &anchor).and_then(|last| {
            // A full replay must land on the live chain head.
            match replay.last() {
                Some(tail) if replay.len() == history.len() && last != head => {
                    Err(SecurityError::IntegrityFailure {
                        sequence: tail.sequence,
                        reason: "chain head mismatch".to_string(),
                    })
                }
                _ => Ok(()),
            }
        });
        match outcome {
            Ok(()) => Ok(report(&replay, range, true)),
            Err(e) => {
                self.report_tampering(&e, "memory");
                Err(e)
            }
        }
    }

    /// Replay a persisted log file.
    pub fn verify_log_file(&self, path: &Path) -> Result<IntegrityReport> {
        verify_log_file(path).inspect_err(|e| self.report_tampering(e, &path.display().to_string()))
    }

    /// Export in-memory entries, re-verifying first when integrity is on.
    pub fn export(&self, format: ExportFormat, range: TimeRange) -> Result<String> {
        if self.features().integrity {
            self.verify_integrity(range)?;
        }
        export_entries(&self.entries(range), format)
    }

    /// Recover the sealed message and context behind `reference`.
    pub async fn decrypt_entry(&self, reference: &str) -> Result<Value> {
        let Some(encryptor) = &self.encryptor else {
            return Err(SecurityError::Encryption(
                "No encryption provider configured".into(),
            ));
        };

        let cached = self.lock().vault.get(reference).cloned();
        let record = match cached {
            Some(record) => record,
            None => {
                let from_disk = match &self.sink {
                    Some(sink) => sink::read_vault(sink.vault_path())?
                        .into_iter()
                        .find(|r| r.reference == reference),
                    None => None,
                };
                from_disk.ok_or_else(|| {
                    SecurityError::Encryption(format!("Unknown encrypted reference {}", reference))
                })?
            }
        };

        let plaintext = encryptor.decrypt(&record.ciphertext).await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn mentions_sensitive(&self, message: &str, context: Option<&Value>) -> bool {
        let keywords = &self.config.sensitive_keywords;
        redact::is_sensitive_key(message, keywords)
            || context.is_some_and(|c| has_sensitive_key(c, keywords))
    }

    fn report_tampering(&self, error: &SecurityError, source: &str) {
        if let SecurityError::IntegrityFailure { sequence, reason } = error {
            self.auditor.record(
                SecurityEvent::new(
                    EventKind::IntegrityFailure,
                    Severity::Critical,
                    "logger",
                    source,
                )
                .with_detail(format!("entry {}: {}", sequence, reason)),
            );
        }
    }

    fn requeue(&self, mut batch: Vec<SecureLogEntry>, mut vault: Vec<VaultRecord>) {
        let mut state = self.lock();
        batch.append(&mut state.buffer);
        state.buffer = batch;
        vault.append(&mut state.pending_vault);
        state.pending_vault = vault;
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replay a persisted NDJSON log.
///
/// A file that starts at sequence 0 is anchored at [`GENESIS_HASH`]. A
/// rotated continuation trusts its first hashed entry and replays the rest
/// from it.
pub fn verify_log_file(path: &Path) -> Result<IntegrityReport> {
    let entries = read_entries(path)?;
    let anchored_at_genesis = entries.first().is_none_or(|e| e.sequence == 0);
    let start = if anchored_at_genesis {
        0
    } else {
        entries.iter().position(|e| !e.unchained).unwrap_or(entries.len())
    };
    let chained = &entries[start..];

    if anchored_at_genesis {
        verify_chain(chained, GENESIS_HASH)?;
    } else if let Some((first, rest)) = chained.split_first() {
        let anchor = first.integrity_hash.clone().unwrap_or_default();
        verify_chain(rest, &anchor)?;
    }

    let refs: Vec<&SecureLogEntry> = chained.iter().collect();
    Ok(report(&refs, TimeRange::all(), anchored_at_genesis))
}

/// Render entries in an export format.
pub fn export_entries(entries: &[SecureLogEntry], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(entries)?),
        ExportFormat::Ndjson => {
            let mut out = String::new();
            for entry in entries {
                out.push_str(&serde_json::to_string(entry)?);
                out.push('\n');
            }
            Ok(out)
        }
        ExportFormat::Text => Ok(entries
            .iter()
            .map(|e| {
                let mut line = format!(
                    "{} {:<8} [{}] {}",
                    e.timestamp.to_rfc3339(),
                    e.level.as_str().to_uppercase(),
                    e.sequence,
                    e.message
                );
                if let Some(ctx) = &e.context {
                    line.push(' ');
                    line.push_str(&ctx.to_string());
                }
                line.push('\n');
                line
            })
            .collect()),
    }
}

fn report(replayed: &[&SecureLogEntry], range: TimeRange, anchored: bool) -> IntegrityReport {
    let in_range: Vec<&&SecureLogEntry> = replayed
        .iter()
        .filter(|e| !e.unchained && range.contains(e.timestamp))
        .collect();
    IntegrityReport {
        checked: in_range.len(),
        first_sequence: in_range.first().map(|e| e.sequence),
        last_sequence: in_range.last().map(|e| e.sequence),
        anchored,
    }
}

fn has_sensitive_key(value: &Value, keywords: &[String]) -> bool {
    match value {
        Value::Object(fields) => fields
            .iter()
            .any(|(k, v)| redact::is_sensitive_key(k, keywords) || has_sensitive_key(v, keywords)),
        Value::Array(items) => items.iter().any(|v| has_sensitive_key(v, keywords)),
        _ => false,
    }
}

/// Next sequence number and chain head for an existing log file.
fn resume_point(path: &Path) -> (u64, String) {
    match read_entries(path) {
        Ok(entries) => {
            let next = entries.last().map(|e| e.sequence + 1).unwrap_or(0);
            let head = entries
                .iter()
                .rev()
                .find_map(|e| e.integrity_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            (next, head)
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                "Existing secure log unreadable ({}), starting a new chain segment",
                e
            );
            (0, GENESIS_HASH.to_string())
        }
    }
}
