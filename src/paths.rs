//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. docguard-specific env var (DOCGUARD_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directory paths for the application.
///
/// Created once at startup, threaded through Config.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Data directory: docguard.log.key
    pub data_dir: PathBuf,

    /// State directory: secure log, audit log
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "DOCGUARD_CONFIG_DIR", || {
            strategy.config_dir().join("docguard")
        });

        let data_dir = env_or(&env_fn, "DOCGUARD_DATA_DIR", || {
            strategy.data_dir().join("docguard")
        });

        let state_dir = env_or(&env_fn, "DOCGUARD_STATE_DIR", || {
            // state_dir() is None on platforms without XDG_STATE_HOME.
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("docguard")
        });

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
        })
    }

    /// Root all three directories under one base (tests, portable installs).
    pub fn under(base: &Path) -> Self {
        Self {
            config_dir: base.join("config"),
            data_dir: base.join("data"),
            state_dir: base.join("state"),
        }
    }

    // ── Convenience accessors for specific files ──

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Log encryption key: data_dir/docguard.log.key
    pub fn log_key(&self) -> PathBuf {
        self.data_dir.join("docguard.log.key")
    }

    /// Security event log: state_dir/docguard.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("docguard.audit.jsonl")
    }

    /// Logs directory
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Default secure log: logs_dir/docguard.jsonl
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("docguard.jsonl")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }
        create_dir_with_mode(&self.logs_dir())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("docguard"),
                data_dir: home.join(".local").join("share").join("docguard"),
                state_dir: home.join(".local").join("state").join("docguard"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(shellexpand::tilde(&v).into_owned()))
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
