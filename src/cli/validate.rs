use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;

use super::{GlobalOpts, read_input};
use crate::security::ValidationResult;

#[derive(Args)]
pub struct ValidateArgs {
    #[command(subcommand)]
    pub command: ValidateCommands,
}

#[derive(Subcommand)]
pub enum ValidateCommands {
    /// Check config text (YAML or TOML) for injection and structure limits
    Config {
        /// File to check, or - for stdin
        file: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a file path against traversal and the allowed root
    Path {
        path: String,

        #[arg(long)]
        json: bool,
    },

    /// Check an environment variable assignment
    Env {
        key: String,
        value: String,

        #[arg(long)]
        json: bool,
    },

    /// Check a JSON document for prototype pollution and script content
    Json {
        /// File to check, or - for stdin
        file: String,

        #[arg(long)]
        json: bool,
    },

    /// Check command-line arguments for shell injection
    Args {
        #[arg(long)]
        json: bool,

        /// Arguments to check (pass after --)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

pub async fn run(args: ValidateArgs, ctx: &GlobalOpts) -> Result<()> {
    let config = ctx.load_config()?;
    let service = ctx.open_service(&config)?;

    let outcome = match args.command {
        ValidateCommands::Config { file, json } => {
            let text = read_input(&file)?;
            report(&service.validate_config_text(&text), json, |_| {
                "configuration is valid".to_string()
            })
        }
        ValidateCommands::Path { path, json } => {
            report(&service.validate_file_path(&path), json, |p| {
                format!("{}", p.display())
            })
        }
        ValidateCommands::Env { key, value, json } => {
            report(&service.validate_env_var(&key, &value), json, |v| {
                format!("{}={}", key, v)
            })
        }
        ValidateCommands::Json { file, json } => {
            let text = read_input(&file)?;
            report(&service.validate_json(&text), json, |v| {
                serde_json::to_string_pretty(v).unwrap_or_default()
            })
        }
        ValidateCommands::Args { json, args } => {
            report(&service.validate_cli_args(&args), json, |a| a.join(" "))
        }
    };

    service.shutdown().await?;
    outcome
}

/// Print a result and fail when it carries errors.
fn report<T: Serialize>(
    result: &ValidationResult<T>,
    json: bool,
    describe: impl Fn(&T) -> String,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        for warning in result.warnings() {
            println!("warning: {}", warning);
        }
        for error in result.errors() {
            println!("error: {}", error);
        }
        if let Some(value) = result.sanitized_value() {
            println!("ok: {}", describe(value));
        }
    }

    if !result.is_valid() {
        anyhow::bail!("Validation failed with {} error(s)", result.errors().len());
    }
    Ok(())
}
