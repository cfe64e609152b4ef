//! Append-only NDJSON persistence with size-based rotation.
//!
//! Each flush appends whole lines under the cross-process
//! [`LogFileLock`]. When the current file has reached `max_bytes` it is
//! renamed to `<path>.<UTC timestamp>` before the batch is written, so a
//! batch never straddles two files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::entry::{SecureLogEntry, VaultRecord};
use crate::concurrency::LogFileLock;
use crate::security::error::{Result, SecurityError};

#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    vault_path: PathBuf,
    max_bytes: u64,
    lock: LogFileLock,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let lock = LogFileLock::for_log(&path)?;
        Ok(Self {
            vault_path: vault_path_for(&path),
            path,
            max_bytes,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    /// Append entries in order, rotating first if the file is full.
    pub async fn append(&self, entries: Vec<SecureLogEntry>) -> Result<()> {
        let sink = self.clone();
        run_blocking(move || {
            let _guard = sink.lock.acquire()?;
            sink.rotate_if_full()?;
            append_lines(&sink.path, &entries)
        })
        .await
    }

    /// Append ciphertext records to the vault sidecar.
    pub async fn append_vault(&self, records: Vec<VaultRecord>) -> Result<()> {
        let sink = self.clone();
        run_blocking(move || {
            let _guard = sink.lock.acquire()?;
            append_lines(&sink.vault_path, &records)
        })
        .await
    }

    fn rotate_if_full(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size == 0 || size < self.max_bytes {
            return Ok(());
        }
        let rotated = rotated_path(&self.path, Utc::now());
        fs::rename(&self.path, &rotated)?;
        info!(
            from = %self.path.display(),
            to = %rotated.display(),
            bytes = size,
            "Rotated secure log"
        );
        Ok(())
    }
}

/// `<path>.<YYYY-MM-DDTHH-MM-SS.mmmZ>`; colons are avoided for portability.
pub fn rotated_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", at.format("%Y-%m-%dT%H-%M-%S%.3fZ")));
    PathBuf::from(name)
}

pub fn vault_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".vault.jsonl");
    PathBuf::from(name)
}

/// Read every entry from an NDJSON log.
///
/// A line that does not parse is reported as an integrity failure at the
/// sequence that should have followed the last good entry.
pub fn read_entries(path: &Path) -> Result<Vec<SecureLogEntry>> {
    read_lines(path)
}

pub fn read_vault(path: &Path) -> Result<Vec<VaultRecord>> {
    read_lines(path)
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut items = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                return Err(SecurityError::IntegrityFailure {
                    sequence: items.len() as u64,
                    reason: format!("unparseable line {}: {}", idx + 1, e),
                });
            }
        }
    }
    Ok(items)
}

fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    debug!(path = %path.display(), count = items.len(), "Appended log lines");
    Ok(())
}

async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SecurityError::Io(io::Error::other(e)))?
}
