use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::paths::Paths;
use crate::security::{
    Algorithm, LogLevel, LoggerConfig, RateLimitProfile, SecurityConfig, SecurityMode,
    SecurityService, ValidatorConfig, default_profiles,
};

/// Rate-limit operation consulted before every config load.
pub const CONFIG_LOAD_OPERATION: &str = "config_load";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub security: SecuritySection,

    /// Per-operation overrides of the built-in quota profiles.
    #[serde(default)]
    pub rate_limit: HashMap<String, RateLimitProfile>,

    #[serde(default)]
    pub logging: LoggerConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Environment handed to documentation-generation subprocesses.
    /// Sensitive values may be stored encrypted (`enc:` prefix).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySection {
    /// basic | optimized | secure | enterprise
    #[serde(default)]
    pub mode: SecurityMode,

    /// Security event log. Default: state_dir/docguard.audit.jsonl
    #[serde(default)]
    pub audit_log: Option<String>,

    /// Log encryption key. Default: data_dir/docguard.log.key
    #[serde(default)]
    pub log_key: Option<String>,
}

/// On-disk syntax, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Format::Yaml
            }
            _ => Format::Toml,
        }
    }
}

impl Config {
    /// Load from the XDG config file, creating it from the template on first run.
    ///
    /// Raw text is checked by a default-mode service, since the real one
    /// depends on what this returns.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let bootstrap = SecurityService::with_defaults()?;
        let mut config = Self::load_from(&path, &bootstrap)?;
        config.paths = paths;
        Ok(config)
    }

    /// Load a config file through the service's quota and text validation.
    ///
    /// The validated (comment-stripped) text is what gets parsed. Paths
    /// are resolved from the environment; callers may replace them.
    pub fn load_from(path: &Path, service: &SecurityService) -> Result<Self> {
        service
            .enforce_rate_limit(CONFIG_LOAD_OPERATION, &path.display().to_string())
            .context("Config load rejected")?;

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let validated = service
            .validate_config_text(&raw)
            .into_result()
            .with_context(|| format!("Config {} failed validation", path.display()))?;

        let config: Config = match Format::of(path) {
            Format::Toml => toml::from_str(&validated)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Format::Yaml => serde_yaml::from_str(&validated)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
        };

        for (operation, profile) in &config.rate_limit {
            profile
                .check()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid [rate_limit.{}] profile", operation))?;
        }

        for (key, value) in &config.env {
            service
                .validate_env_var(key, value)
                .into_result()
                .with_context(|| format!("Invalid [env] entry {}", key))?;
        }

        debug!(path = %path.display(), mode = %config.security.mode, "Loaded config");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_file())
    }

    /// Write in the syntax matching the file extension.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = match Format::of(path) {
            Format::Toml => toml::to_string_pretty(self)?,
            Format::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        Self::write_template(&self.paths.config_file())
    }

    /// Write the commented default config to `path`.
    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Assemble the service configuration, filling file locations from [`Paths`].
    pub fn security_config(&self) -> SecurityConfig {
        let mut logging = self.logging.clone();
        if logging.file_path().is_none() {
            logging.file = Some(self.paths.log_file().to_string_lossy().into_owned());
        }

        SecurityConfig {
            mode: self.security.mode,
            rate_limits: self.rate_limit.clone(),
            validator: self.validator.clone(),
            logging,
            audit_log: Some(expand_or(
                self.security.audit_log.as_deref(),
                self.paths.audit_log(),
            )),
            log_key: Some(expand_or(
                self.security.log_key.as_deref(),
                self.paths.log_key(),
            )),
        }
    }

    /// Decrypted `[env]` table, ready to hand to a subprocess.
    pub async fn resolved_env(&self, service: &SecurityService) -> Result<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        for (key, value) in &self.env {
            let plain = service
                .decrypt_field(value)
                .await
                .with_context(|| format!("Failed to decrypt [env] entry {}", key))?;
            resolved.insert(key.clone(), plain);
        }
        Ok(resolved)
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["security", "mode"] => Ok(self.security.mode.to_string()),
            ["security", "audit_log"] => Ok(self.security.audit_log.clone().unwrap_or_default()),
            ["security", "log_key"] => Ok(self.security.log_key.clone().unwrap_or_default()),
            ["logging", "level"] => Ok(self.logging.level.to_string()),
            ["logging", "file"] => Ok(self.logging.file.clone().unwrap_or_default()),
            ["logging", "max_file_bytes"] => Ok(self.logging.max_file_bytes.to_string()),
            ["logging", "buffer_size"] => Ok(self.logging.buffer_size.to_string()),
            ["logging", "flush_interval_ms"] => Ok(self.logging.flush_interval_ms.to_string()),
            ["logging", "rate_limit_severe"] => Ok(self.logging.rate_limit_severe.to_string()),
            ["validator", "allowed_root"] => {
                Ok(self.validator.allowed_root.clone().unwrap_or_default())
            }
            ["validator", "max_config_length"] => Ok(self.validator.max_config_length.to_string()),
            ["validator", "max_nesting_depth"] => Ok(self.validator.max_nesting_depth.to_string()),
            ["validator", "max_path_length"] => Ok(self.validator.max_path_length.to_string()),
            ["rate_limit", operation, field] => {
                let profile = self.profile(operation);
                match *field {
                    "window_ms" => Ok(profile.window_ms.to_string()),
                    "max_requests" => Ok(profile.max_requests.to_string()),
                    "bucket_capacity" => Ok(profile.bucket_capacity.to_string()),
                    "refill_rate" => Ok(profile.refill_rate.to_string()),
                    "algorithm" => Ok(algorithm_name(profile.algorithm).to_string()),
                    _ => anyhow::bail!("Unknown config key: {}", key),
                }
            }
            ["env", name] => self
                .env
                .get(*name)
                .cloned()
                .with_context(|| format!("Unknown config key: {}", key)),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["security", "mode"] => {
                self.security.mode = value.parse().map_err(anyhow::Error::msg)?
            }
            ["security", "audit_log"] => self.security.audit_log = non_empty(value),
            ["security", "log_key"] => self.security.log_key = non_empty(value),
            ["logging", "level"] => {
                self.logging.level = value.parse::<LogLevel>().map_err(anyhow::Error::msg)?
            }
            ["logging", "file"] => self.logging.file = non_empty(value),
            ["logging", "max_file_bytes"] => self.logging.max_file_bytes = value.parse()?,
            ["logging", "buffer_size"] => self.logging.buffer_size = value.parse()?,
            ["logging", "flush_interval_ms"] => self.logging.flush_interval_ms = value.parse()?,
            ["logging", "rate_limit_severe"] => self.logging.rate_limit_severe = value.parse()?,
            ["validator", "allowed_root"] => self.validator.allowed_root = non_empty(value),
            ["validator", "max_config_length"] => {
                self.validator.max_config_length = value.parse()?
            }
            ["validator", "max_nesting_depth"] => {
                self.validator.max_nesting_depth = value.parse()?
            }
            ["validator", "max_path_length"] => self.validator.max_path_length = value.parse()?,
            ["rate_limit", operation, field] => {
                let mut profile = self.profile(operation);
                match *field {
                    "window_ms" => profile.window_ms = value.parse()?,
                    "max_requests" => profile.max_requests = value.parse()?,
                    "bucket_capacity" => profile.bucket_capacity = value.parse()?,
                    "refill_rate" => profile.refill_rate = value.parse()?,
                    "algorithm" => profile.algorithm = parse_algorithm(value)?,
                    _ => anyhow::bail!("Unknown config key: {}", key),
                }
                profile.check().map_err(anyhow::Error::msg)?;
                self.rate_limit.insert(operation.to_string(), profile);
            }
            ["env", name] => {
                self.env.insert(name.to_string(), value.to_string());
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// Effective profile for an operation: override, built-in, then default.
    fn profile(&self, operation: &str) -> RateLimitProfile {
        if let Some(profile) = self.rate_limit.get(operation) {
            return profile.clone();
        }
        let builtin = default_profiles();
        builtin
            .get(operation)
            .or_else(|| builtin.get(crate::security::rate_limit::DEFAULT_OPERATION))
            .cloned()
            .unwrap_or_else(|| RateLimitProfile::token_bucket(60_000, 60, 1.0))
    }
}

fn expand_or(configured: Option<&str>, default: PathBuf) -> PathBuf {
    configured
        .filter(|p| !p.trim().is_empty())
        .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
        .unwrap_or(default)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::TokenBucket => "token_bucket",
        Algorithm::SlidingWindow => "sliding_window",
        Algorithm::FixedWindow => "fixed_window",
    }
}

fn parse_algorithm(value: &str) -> Result<Algorithm> {
    match value.trim().to_ascii_lowercase().as_str() {
        "token_bucket" => Ok(Algorithm::TokenBucket),
        "sliding_window" => Ok(Algorithm::SlidingWindow),
        "fixed_window" => Ok(Algorithm::FixedWindow),
        other => anyhow::bail!(
            "Unknown algorithm '{}'. Expected token_bucket, sliding_window or fixed_window",
            other
        ),
    }
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# docguard Configuration
# Auto-created on first run. Edit as needed.

[security]
# basic | optimized | secure | enterprise
#   basic       development: redaction and validation, no chaining
#   optimized   throughput: caching and buffered writes
#   secure      production default: encryption, audit, integrity chain
#   enterprise  secure plus caching and buffered writes
mode = "secure"

# audit_log = "~/.local/state/docguard/docguard.audit.jsonl"
# log_key = "~/.local/share/docguard/docguard.log.key"

[logging]
level = "info"
# file = "~/.local/state/docguard/logs/docguard.jsonl"
max_file_bytes = 10485760
buffer_size = 100
flush_interval_ms = 5000
# Apply the logging quota to error and critical entries too
rate_limit_severe = false

[validator]
# Every validated path must resolve under this directory (default: working directory)
# allowed_root = "~/docs"
max_config_length = 1048576
max_nesting_depth = 10
max_path_length = 4096

# Quota overrides, one table per operation:
# config_load, error_generation, resource_probe, logging, api_call, default
# [rate_limit.api_call]
# window_ms = 60000
# max_requests = 10
# bucket_capacity = 10
# refill_rate = 1.0
# algorithm = "token_bucket"    # token_bucket | sliding_window | fixed_window

# Environment for documentation generators. Set sensitive values with
# `docguard config set env.NAME value` to store them encrypted.
# [env]
# SITE_URL = "https://docs.example.com"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SecurityService {
        SecurityService::with_defaults().unwrap()
    }

    #[test]
    fn template_passes_validation_and_parses() {
        let svc = service();
        let validated = svc
            .validate_config_text(DEFAULT_CONFIG_TEMPLATE)
            .into_result()
            .unwrap();
        let config: Config = toml::from_str(&validated).unwrap();
        assert_eq!(config.security.mode, SecurityMode::Secure);
        assert_eq!(config.validator.max_nesting_depth, 10);
        assert!(config.rate_limit.is_empty());
    }

    #[test]
    fn toml_and_yaml_load() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service();

        let toml_path = tmp.path().join("docguard.toml");
        fs::write(
            &toml_path,
            "[security]\nmode = \"enterprise\"\n\n[rate_limit.api_call]\nwindow_ms = 1000\nmax_requests = 3\nbucket_capacity = 3\nrefill_rate = 3.0\n",
        )
        .unwrap();
        let config = Config::load_from(&toml_path, &svc).unwrap();
        assert_eq!(config.security.mode, SecurityMode::Enterprise);
        assert_eq!(config.rate_limit["api_call"].max_requests, 3);

        let yaml_path = tmp.path().join("docguard.yaml");
        fs::write(
            &yaml_path,
            "# comment\nsecurity:\n  mode: basic\nlogging:\n  level: warn\n",
        )
        .unwrap();
        let config = Config::load_from(&yaml_path, &svc).unwrap();
        assert_eq!(config.security.mode, SecurityMode::Basic);
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn injected_config_is_rejected_before_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service();
        let path = tmp.path().join("evil.yaml");
        fs::write(&path, "title: \"${process.env.SECRET}\"\n").unwrap();

        let err = Config::load_from(&path, &svc).unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("failed validation"), "{}", text);
        assert!(text.contains("Template interpolation"), "{}", text);
    }

    #[test]
    fn invalid_env_entry_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service();
        let path = tmp.path().join("c.toml");
        fs::write(&path, "[env]\n\"1BAD\" = \"x\"\n").unwrap();
        assert!(Config::load_from(&path, &svc).is_err());
    }

    #[test]
    fn config_load_is_rate_limited() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.toml");
        fs::write(&path, "[security]\nmode = \"basic\"\n").unwrap();

        let mut limits = HashMap::new();
        limits.insert(
            CONFIG_LOAD_OPERATION.to_string(),
            RateLimitProfile::fixed_window(60_000, 1),
        );
        let svc = SecurityService::new(SecurityConfig {
            rate_limits: limits,
            ..SecurityConfig::default()
        })
        .unwrap();

        assert!(Config::load_from(&path, &svc).is_ok());
        let err = Config::load_from(&path, &svc).unwrap_err();
        assert!(format!("{:#}", err).contains("Too many requests"));
    }

    #[test]
    fn unusable_refill_rate_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service();
        let path = tmp.path().join("c.toml");
        fs::write(
            &path,
            "[rate_limit.api_call]\nwindow_ms = 1000\nmax_requests = 2\nbucket_capacity = 2\nrefill_rate = -0.5\n",
        )
        .unwrap();
        let err = Config::load_from(&path, &svc).unwrap_err();
        assert!(format!("{:#}", err).contains("refill_rate"), "{:#}", err);

        let mut config = Config::default();
        assert!(config.set_value("rate_limit.api_call.refill_rate", "inf").is_err());
        assert!(config.set_value("rate_limit.api_call.refill_rate", "NaN").is_err());
        assert!(config.set_value("rate_limit.api_call.refill_rate", "0").is_ok());
    }

    #[test]
    fn get_and_set_by_dotted_key() {
        let mut config = Config::default();
        config.set_value("security.mode", "basic").unwrap();
        config.set_value("logging.level", "error").unwrap();
        config.set_value("rate_limit.api_call.max_requests", "7").unwrap();
        config.set_value("rate_limit.api_call.algorithm", "fixed_window").unwrap();
        config.set_value("env.SITE_URL", "https://docs").unwrap();

        assert_eq!(config.get_value("security.mode").unwrap(), "basic");
        assert_eq!(config.get_value("logging.level").unwrap(), "error");
        assert_eq!(config.get_value("rate_limit.api_call.max_requests").unwrap(), "7");
        assert_eq!(
            config.get_value("rate_limit.api_call.algorithm").unwrap(),
            "fixed_window"
        );
        // Untouched fields of an overridden profile keep the built-in values.
        assert_eq!(
            config.get_value("rate_limit.api_call.window_ms").unwrap(),
            "60000"
        );
        assert_eq!(config.get_value("env.SITE_URL").unwrap(), "https://docs");

        assert!(config.set_value("security.mode", "paranoid").is_err());
        assert!(config.get_value("nope.key").is_err());
    }

    #[test]
    fn save_round_trips_in_both_formats() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service();
        let mut config = Config::default();
        config.set_value("security.mode", "optimized").unwrap();
        config.set_value("validator.max_path_length", "512").unwrap();

        for name in ["out.toml", "out.yml"] {
            let path = tmp.path().join(name);
            config.save_to(&path).unwrap();
            let loaded = Config::load_from(&path, &svc).unwrap();
            assert_eq!(loaded.security.mode, SecurityMode::Optimized);
            assert_eq!(loaded.validator.max_path_length, 512);
        }
    }

    #[tokio::test]
    async fn encrypted_env_values_resolve_to_plaintext() {
        let encryptor = std::sync::Arc::new(
            crate::security::AesGcmEncryptor::new(&[7u8; 32]).unwrap(),
        );
        let svc = SecurityService::with_encryptor(SecurityConfig::default(), encryptor).unwrap();

        let sealed = svc.encrypt_field("API_TOKEN", "tok-123").await.unwrap();
        assert!(sealed.starts_with("enc:"));

        let mut config = Config::default();
        config.env.insert("API_TOKEN".into(), sealed);
        config.env.insert("SITE_URL".into(), "https://docs".into());

        let env = config.resolved_env(&svc).await.unwrap();
        assert_eq!(env["API_TOKEN"], "tok-123");
        assert_eq!(env["SITE_URL"], "https://docs");
    }

    #[test]
    fn security_config_fills_default_locations() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            paths: Paths::under(tmp.path()),
            ..Config::default()
        };
        let sc = config.security_config();
        assert_eq!(sc.audit_log, Some(config.paths.audit_log()));
        assert_eq!(sc.log_key, Some(config.paths.log_key()));
        assert_eq!(sc.logging.file_path(), Some(config.paths.log_file()));
    }
}
