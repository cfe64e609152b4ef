use anyhow::Result;
use clap::{Args, Subcommand};

use super::GlobalOpts;
use crate::security::{RateLimitStatus, SecurityService};

#[derive(Args)]
pub struct LimitArgs {
    #[command(subcommand)]
    pub command: LimitCommands,
}

#[derive(Subcommand)]
pub enum LimitCommands {
    /// Consume quota for an operation and show each decision
    Check {
        /// Operation name (config_load, api_call, ...)
        operation: String,

        /// Caller identity the quota is keyed by
        #[arg(short, long, default_value = "cli")]
        source: String,

        /// Number of requests to make
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Show the effective profile and current quota without consuming it
    Status {
        operation: String,

        #[arg(short, long, default_value = "cli")]
        source: String,

        #[arg(long)]
        json: bool,
    },
}

pub async fn run(args: LimitArgs, ctx: &GlobalOpts) -> Result<()> {
    let config = ctx.load_config()?;
    let service = ctx.open_service(&config)?;

    match args.command {
        LimitCommands::Check {
            operation,
            source,
            count,
        } => check(&service, &operation, &source, count),
        LimitCommands::Status {
            operation,
            source,
            json,
        } => status(&service, &operation, &source, json)?,
    }

    service.shutdown().await?;
    Ok(())
}

fn check(service: &SecurityService, operation: &str, source: &str, count: u32) {
    let mut allowed = 0;
    for i in 1..=count {
        let decision = service.check_rate_limit(operation, source);
        if decision.allowed {
            allowed += 1;
        }
        println!(
            "#{:<4} {}  remaining={} {}",
            i,
            if decision.allowed { "allowed" } else { "denied " },
            decision.status.remaining,
            describe_block(&decision.status)
        );
    }
    println!();
    println!("{} of {} allowed", allowed, count);
}

fn status(service: &SecurityService, operation: &str, source: &str, json: bool) -> Result<()> {
    let profile = service.limiter().profile(operation);
    let status = service.rate_limit_status(operation, source);

    if json {
        let out = serde_json::json!({
            "operation": operation,
            "source": source,
            "profile": profile,
            "status": status,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Operation:  {}", operation);
    println!("Algorithm:  {:?}", profile.algorithm);
    println!("Window:     {}ms", profile.window_ms);
    println!("Limit:      {}", status.limit);
    println!("Remaining:  {}", status.remaining);
    println!("Resets in:  {}ms", status.reset_after.as_millis());
    let block = describe_block(&status);
    if !block.is_empty() {
        println!("State:      {}", block);
    }
    Ok(())
}

fn describe_block(status: &RateLimitStatus) -> String {
    match (status.blacklisted, status.blocked, status.retry_after) {
        (true, _, _) => "blacklisted".to_string(),
        (_, true, Some(retry)) => format!("blocked, retry after {}ms", retry.as_millis()),
        (_, true, None) => "blocked".to_string(),
        (_, false, Some(retry)) => format!("retry after {}ms", retry.as_millis()),
        _ => String::new(),
    }
}
