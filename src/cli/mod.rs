pub mod config;
pub mod keygen;
pub mod limit;
pub mod log;
pub mod paths;
pub mod status;
pub mod validate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::paths::Paths;
use crate::security::{SecurityMode, SecurityService};

#[derive(Parser)]
#[command(name = "docguard")]
#[command(
    author,
    version,
    about = "Input validation, rate limiting and tamper-evident logging for documentation tooling"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file (TOML, or YAML by extension)
    #[arg(short, long, global = true, env = "DOCGUARD_CONFIG")]
    pub config: Option<String>,

    /// Security mode override: basic, optimized, secure, enterprise
    #[arg(short, long, global = true, env = "DOCGUARD_MODE")]
    pub mode: Option<SecurityMode>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate untrusted input
    Validate(validate::ValidateArgs),

    /// Write, verify, export and decrypt the secure log
    Log(log::LogArgs),

    /// Exercise and inspect rate limits
    Limit(limit::LimitArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show the active policy and component state
    Status(status::StatusArgs),

    /// Show resolved XDG directory paths
    Paths,

    /// Generate the log encryption key
    Keygen(keygen::KeygenArgs),
}

/// Global options shared by every subcommand.
pub struct GlobalOpts {
    pub config_path: Option<PathBuf>,
    pub mode: Option<SecurityMode>,
}

impl Cli {
    pub fn global_opts(&self) -> GlobalOpts {
        GlobalOpts {
            config_path: self
                .config
                .as_deref()
                .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned())),
            mode: self.mode,
        }
    }
}

impl GlobalOpts {
    /// Load the config from `--config` or the XDG location.
    pub fn load_config(&self) -> Result<Config> {
        match &self.config_path {
            Some(path) => {
                let bootstrap = SecurityService::with_defaults()?;
                let mut config = Config::load_from(path, &bootstrap)?;
                config.paths = Paths::resolve()?;
                Ok(config)
            }
            None => Config::load(),
        }
    }

    /// Path that `config set` and `config init` write to.
    pub fn config_file(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Config::config_path(),
        }
    }

    /// Build the service for this invocation.
    ///
    /// A log key is only generated when the effective mode encrypts;
    /// an existing key is always loaded so `log decrypt` works in any mode.
    pub fn open_service(&self, config: &Config) -> Result<Arc<SecurityService>> {
        config.paths.ensure_dirs()?;

        let mut security = config.security_config();
        if let Some(mode) = self.mode {
            security.mode = mode;
        }
        if let Some(key) = &security.log_key
            && !key.exists()
            && !security.mode.features().encrypt_sensitive
        {
            debug!(key = %key.display(), "No log key and mode does not encrypt; skipping");
            security.log_key = None;
        }

        let service = SecurityService::new(security).context("Failed to start security service")?;
        Ok(Arc::new(service))
    }
}

/// Read a file argument, with `-` meaning stdin.
pub(crate) fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))
}

pub async fn run(cli: Cli) -> Result<()> {
    let ctx = cli.global_opts();
    match cli.command {
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Log(args) => log::run(args, &ctx).await,
        Commands::Limit(args) => limit::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Paths => paths::run(),
        Commands::Keygen(args) => keygen::run(args, &ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_mode_parses_anywhere() {
        let cli = Cli::try_parse_from(["docguard", "status", "--mode", "enterprise"]).unwrap();
        assert_eq!(cli.mode, Some(SecurityMode::Enterprise));

        let err = Cli::try_parse_from(["docguard", "--mode", "paranoid", "status"]);
        assert!(err.is_err());
    }

    #[test]
    fn trailing_args_are_captured_verbatim() {
        let cli = Cli::try_parse_from([
            "docguard", "validate", "args", "--", "--out", "docs; rm -rf /",
        ])
        .unwrap();
        match cli.command {
            Commands::Validate(validate::ValidateArgs {
                command: validate::ValidateCommands::Args { args, .. },
            }) => assert_eq!(args, vec!["--out", "docs; rm -rf /"]),
            _ => panic!("expected validate args"),
        }
    }
}
