use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Error and critical entries.
    pub fn is_severe(&self) -> bool {
        *self >= LogLevel::Error
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" | "fatal" => Ok(LogLevel::Critical),
            other => Err(format!("Unknown log level '{}'", other)),
        }
    }
}

/// One persisted log record. Built once by the logger and never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureLogEntry {
    /// Position in the chain, assigned in call order.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Sanitized, redacted message, or `[ENCRYPTED]`.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// True when injection filtering or redaction changed the content.
    pub filtered: bool,
    pub correlation_id: String,
    /// Vault reference for the encrypted original.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_ref: Option<String>,
    /// Logged while chaining was off. Replay skips these; flipping the flag on
    /// a chained entry breaks the link to the next one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unchained: bool,
    /// `SHA-256(canonical entry ‖ previous hash)`, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
}

/// Ciphertext of an encrypted entry, kept apart from the plaintext log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultRecord {
    pub reference: String,
    pub sequence: u64,
    pub ciphertext: String,
}

/// Inclusive time window; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts <= e)
    }

    /// True when `ts` is past the end of the window.
    pub fn is_after(&self, ts: DateTime<Utc>) -> bool {
        self.end.is_some_and(|e| ts > e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty JSON array.
    Json,
    /// One entry per line.
    Ndjson,
    /// `timestamp level [sequence] message`, one per line.
    Text,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "ndjson" | "jsonl" => Ok(ExportFormat::Ndjson),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(format!("Unknown export format '{}'", other)),
        }
    }
}
