//! Append-only, hash-chained security event log.
//!
//! Registered on the [`EventBus`](super::events::EventBus) when the
//! `audit` feature is on. Every security event becomes one JSONL line
//! carrying the SHA-256 of the previous line, forming a tamper-evident
//! chain independent of the application log.
//!
//! # Format
//!
//! | Field | Description |
//! |-------|-------------|
//! | `kind`, `source`, `input_snippet`, `timestamp`, `severity`, `detail` | The [`SecurityEvent`] |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line (chain link, hex-encoded) |
//!
//! # Chain Integrity
//!
//! The first line links to `000...000` (64 zeros). If the last line is
//! unparseable when the next event arrives, a `chain_recovery` record is
//! written first so the break point itself is on record.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::events::{EventKind, EventSink, SecurityEvent, Severity};
use crate::concurrency::LogFileLock;

/// The link used by the first record in the chain.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Source recorded on chain-recovery records.
const RECOVERY_SOURCE: &str = "audit_system";

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub event: SecurityEvent,
    /// SHA-256 of the previous JSONL line (hex-encoded).
    pub prev_entry_sha256: String,
}

/// Event sink persisting every security event to a chained JSONL file.
pub struct FileAuditSink {
    path: PathBuf,
    lock: LogFileLock,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock = LogFileLock::for_log(&path)
            .with_context(|| format!("Failed to prepare audit lock for {}", path.display()))?;
        Ok(Self { path, lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, linking it to the current last line.
    pub fn append(&self, event: &SecurityEvent) -> Result<()> {
        let _guard = self.lock.acquire().context("Failed to lock audit log")?;

        let prev_hash = match last_line(&self.path)? {
            None => GENESIS_HASH.to_string(),
            Some(line) if serde_json::from_str::<AuditRecord>(&line).is_ok() => {
                sha256_hex(line.as_bytes())
            }
            Some(line) => {
                let recovery = AuditRecord {
                    event: SecurityEvent::new(
                        EventKind::IntegrityFailure,
                        Severity::High,
                        RECOVERY_SOURCE,
                        "",
                    )
                    .with_detail(format!(
                        "Previous audit record corrupted ({} bytes), chain_recovery: new chain segment",
                        line.len()
                    )),
                    prev_entry_sha256: sha256_hex(line.as_bytes()),
                };
                let json = serde_json::to_string(&recovery)
                    .context("Failed to serialize recovery record")?;
                append_line(&self.path, &json)?;
                sha256_hex(json.as_bytes())
            }
        };

        let record = AuditRecord {
            event: event.clone(),
            prev_entry_sha256: prev_hash,
        };
        let json = serde_json::to_string(&record).context("Failed to serialize audit record")?;
        append_line(&self.path, &json)
    }
}

impl EventSink for FileAuditSink {
    fn record(&self, event: &SecurityEvent) {
        if let Err(e) = self.append(event) {
            warn!(path = %self.path.display(), "Failed to append audit record: {:#}", e);
        }
    }
}

fn last_line(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .rev()
        .find(|l| !l.is_empty())
        .map(str::to_string))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).context("Failed to create audit log directory")?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit record")?;
    Ok(())
}

/// Read all parseable records. Corrupted lines are skipped.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Line indices where the chain is broken. Empty means intact.
///
/// Corrupted lines count as broken.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(record) = serde_json::from_str::<AuditRecord>(line) else {
            broken.push(i);
            continue;
        };
        let expected = match i {
            0 => GENESIS_HASH.to_string(),
            _ => sha256_hex(lines[i - 1].as_bytes()),
        };
        if record.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }
    Ok(broken)
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::events::EventBus;
    use std::sync::Arc;

    fn event(kind: EventKind, input: &str) -> SecurityEvent {
        SecurityEvent::new(kind, Severity::High, "test", input)
    }

    #[test]
    fn chain_intact_after_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(tmp.path().join("audit.jsonl")).unwrap();
        for i in 0..5 {
            sink.append(&event(EventKind::PathTraversal, &format!("../{}", i)))
                .unwrap();
        }

        let records = read_audit_log(sink.path()).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].prev_entry_sha256, GENESIS_HASH);
        assert!(verify_audit_chain(sink.path()).unwrap().is_empty());
    }

    #[test]
    fn edited_line_breaks_next_link() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(tmp.path().join("audit.jsonl")).unwrap();
        for i in 0..3 {
            sink.append(&event(EventKind::ShellInjection, &format!("arg{}", i)))
                .unwrap();
        }

        let content = fs::read_to_string(sink.path()).unwrap();
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        lines[1] = lines[1].replace("arg1", "argX");
        fs::write(sink.path(), lines.join("\n") + "\n").unwrap();

        assert_eq!(verify_audit_chain(sink.path()).unwrap(), vec![2]);
    }

    #[test]
    fn corrupted_tail_starts_recovery_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(tmp.path().join("audit.jsonl")).unwrap();
        sink.append(&event(EventKind::Blocked, "a")).unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(sink.path()).unwrap();
        writeln!(file, "not json").unwrap();
        drop(file);

        sink.append(&event(EventKind::Blocked, "b")).unwrap();

        let records = read_audit_log(sink.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].event.source, RECOVERY_SOURCE);
        assert!(records[1].event.detail.as_deref().unwrap().contains("corrupted"));
        // Only the garbage line itself is broken; recovery links to it.
        assert_eq!(verify_audit_chain(sink.path()).unwrap(), vec![1]);
    }

    #[test]
    fn registered_sink_receives_bus_events() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileAuditSink::new(tmp.path().join("audit.jsonl")).unwrap());
        let bus = EventBus::new();
        bus.register(sink.clone());

        bus.emit(&event(EventKind::PrototypePollution, "__proto__"));
        bus.emit(&event(EventKind::ConfigInjection, "!!python/object"));

        let records = read_audit_log(sink.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.kind, EventKind::PrototypePollution);
        assert_eq!(records[1].event.input_snippet, "!!python/object");
    }

    #[test]
    fn missing_log_is_empty_and_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("none.jsonl");
        assert!(read_audit_log(&path).unwrap().is_empty());
        assert!(verify_audit_chain(&path).unwrap().is_empty());
    }
}
