use anyhow::{Context, Result};
use clap::Args;

use super::GlobalOpts;
use crate::security::ensure_log_key;

#[derive(Args)]
pub struct KeygenArgs {
    /// Replace an existing key. Entries sealed with the old key become unreadable.
    #[arg(short, long)]
    pub force: bool,
}

pub fn run(args: KeygenArgs, ctx: &GlobalOpts) -> Result<()> {
    let config = ctx.load_config()?;
    let path = config
        .security_config()
        .log_key
        .context("No log key location configured")?;

    if path.exists() {
        if !args.force {
            anyhow::bail!(
                "Log key already exists at {}. Use --force to replace it.",
                path.display()
            );
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }

    ensure_log_key(&path)?;
    println!("Wrote log encryption key to {}", path.display());
    Ok(())
}
