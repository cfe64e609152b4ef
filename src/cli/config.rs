use anyhow::Result;
use clap::{Args, Subcommand};

use super::GlobalOpts;
use crate::config::Config;
use crate::security::service::ENCRYPTED_FIELD_PREFIX;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default), yaml or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., security.mode, rate_limit.api_call.max_requests)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., security.mode, env.API_TOKEN)
        key: String,

        /// Value to set. Sensitive env.* values are stored encrypted.
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, ctx: &GlobalOpts) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(ctx, &format),
        ConfigCommands::Get { key } => get_config(ctx, &key),
        ConfigCommands::Set { key, value } => set_config(ctx, &key, &value).await,
        ConfigCommands::Path => show_path(ctx),
        ConfigCommands::Init { force } => init_config(ctx, force),
    }
}

fn show_config(ctx: &GlobalOpts, format: &str) -> Result<()> {
    let config = ctx.load_config()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "yaml" | "yml" => print!("{}", serde_yaml::to_string(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn get_config(ctx: &GlobalOpts, key: &str) -> Result<()> {
    let config = ctx.load_config()?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

async fn set_config(ctx: &GlobalOpts, key: &str, value: &str) -> Result<()> {
    let mut config = ctx.load_config()?;

    let stored = match key.strip_prefix("env.") {
        Some(name) => {
            let service = ctx.open_service(&config)?;
            let sanitized = service.validate_env_var(name, value).into_result()?;
            let stored = service.encrypt_field(name, &sanitized).await?;
            service.shutdown().await?;
            stored
        }
        None => value.to_string(),
    };

    config.set_value(key, &stored)?;
    config.save_to(&ctx.config_file()?)?;

    if stored.starts_with(ENCRYPTED_FIELD_PREFIX) {
        println!("Set {} (stored encrypted)", key);
    } else {
        println!("Set {} = {}", key, stored);
    }
    Ok(())
}

fn show_path(ctx: &GlobalOpts) -> Result<()> {
    let path = ctx.config_file()?;
    println!("{}", path.display());
    Ok(())
}

fn init_config(ctx: &GlobalOpts, force: bool) -> Result<()> {
    let path = ctx.config_file()?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    Config::write_template(&path)?;

    println!("Created config file at {}", path.display());
    Ok(())
}
