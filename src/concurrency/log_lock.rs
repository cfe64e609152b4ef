//! Cross-process log lock using advisory file locking (fs2 flock).
//!
//! Serializes appends and rotation of a secure log file across processes
//! (CLI invocations, embedded services) so NDJSON lines never interleave
//! and a rotation never races an append.

use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Advisory lock guarding one log file.
///
/// The lock file sits beside the log as `<log>.lock`, so renaming the log
/// during rotation does not release it.
#[derive(Debug, Clone)]
pub struct LogFileLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct LogFileLockGuard {
    file: File,
}

impl Drop for LogFileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl LogFileLock {
    pub fn for_log(log_path: &Path) -> io::Result<Self> {
        let mut name = log_path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking acquire; call from `spawn_blocking` in async code.
    pub fn acquire(&self) -> io::Result<LogFileLockGuard> {
        let file = File::create(&self.path)?;
        file.lock_exclusive()?;
        Ok(LogFileLockGuard { file })
    }

    /// Non-blocking try-acquire; `None` if another process holds it.
    pub fn try_acquire(&self) -> io::Result<Option<LogFileLockGuard>> {
        let file = File::create(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LogFileLockGuard { file })),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn lock_file_sits_beside_log() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = LogFileLock::for_log(&tmp.path().join("logs/app.jsonl")).unwrap();
        assert!(lock.path().ends_with("logs/app.jsonl.lock"));
        assert!(tmp.path().join("logs").is_dir());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = LogFileLock::for_log(&tmp.path().join("app.jsonl")).unwrap();

        let guard = lock.acquire().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());
        drop(guard);
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn concurrent_appenders_serialize() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("app.jsonl");
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let log = log.clone();
                let b = barrier.clone();
                std::thread::spawn(move || {
                    let lock = LogFileLock::for_log(&log).unwrap();
                    b.wait();
                    let _guard = lock.acquire().unwrap();
                    let mut content = fs::read_to_string(&log).unwrap_or_default();
                    content.push_str(&format!("{}\n", i));
                    fs::write(&log, content).unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 4);
    }
}
