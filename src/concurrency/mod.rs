//! Cross-process coordination primitives.

mod log_lock;

pub use log_lock::{LogFileLock, LogFileLockGuard};
