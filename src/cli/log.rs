use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::GlobalOpts;
use crate::security::logger::export_entries;
use crate::security::{ExportFormat, LogLevel, SecurityService, TimeRange, read_log_entries};

#[derive(Args)]
pub struct LogArgs {
    #[command(subcommand)]
    pub command: LogCommands,
}

#[derive(Subcommand)]
pub enum LogCommands {
    /// Append one entry through the secure pipeline
    Write {
        message: String,

        /// debug, info, warn, error or critical
        #[arg(short, long, default_value = "info")]
        level: LogLevel,

        /// JSON object attached as context
        #[arg(long = "ctx")]
        context: Option<String>,
    },

    /// Replay the hash chain of a log file
    Verify {
        /// Log file (default: the configured secure log)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Export entries, verifying the chain first when integrity is on
    Export {
        /// json, ndjson or text
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Only entries at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only entries at or before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Recover the original content of an encrypted entry
    Decrypt {
        /// The entry's encrypted_ref
        reference: String,
    },
}

pub async fn run(args: LogArgs, ctx: &GlobalOpts) -> Result<()> {
    let config = ctx.load_config()?;
    let service = ctx.open_service(&config)?;

    let outcome = match args.command {
        LogCommands::Write {
            message,
            level,
            context,
        } => write(&service, level, &message, context.as_deref()).await,
        LogCommands::Verify { file } => verify(&service, file),
        LogCommands::Export {
            format,
            since,
            until,
            file,
        } => export(&service, format, TimeRange { start: since, end: until }, file),
        LogCommands::Decrypt { reference } => {
            let value = service.decrypt_entry(&reference).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    };

    service.shutdown().await?;
    outcome
}

async fn write(
    service: &SecurityService,
    level: LogLevel,
    message: &str,
    context: Option<&str>,
) -> Result<()> {
    let context = match context {
        Some(raw) => Some(
            service
                .validate_json(raw)
                .into_result()
                .context("Invalid --ctx")?,
        ),
        None => None,
    };

    service.log(level, message, context).await?;
    service.flush().await?;

    match service.logger().entries(TimeRange::all()).last() {
        Some(entry) => println!("{}", serde_json::to_string_pretty(entry)?),
        None => println!("Entry dropped (below level {} or over quota)", service.logger().config().level),
    }
    Ok(())
}

fn log_file(service: &SecurityService, file: Option<PathBuf>) -> Result<PathBuf> {
    file.or_else(|| service.logger().file_path().map(PathBuf::from))
        .context("No log file configured. Set [logging] file or pass --file.")
}

fn verify(service: &SecurityService, file: Option<PathBuf>) -> Result<()> {
    let path = log_file(service, file)?;
    let report = service.verify_log_file(&path)?;

    println!("Log integrity verified: {}", path.display());
    println!("  entries checked: {}", report.checked);
    if let (Some(first), Some(last)) = (report.first_sequence, report.last_sequence) {
        println!("  sequences:       {}..={}", first, last);
    }
    if !report.anchored {
        println!("  note: continuation of a rotated file; first entry trusted");
    }
    Ok(())
}

fn export(
    service: &SecurityService,
    format: ExportFormat,
    range: TimeRange,
    file: Option<PathBuf>,
) -> Result<()> {
    let path = log_file(service, file)?;
    if service.features().integrity {
        service.verify_log_file(&path)?;
    }

    let entries: Vec<_> = read_log_entries(&path)?
        .into_iter()
        .filter(|e| range.contains(e.timestamp))
        .collect();
    print!("{}", export_entries(&entries, format)?);
    if format == ExportFormat::Json {
        println!();
    }
    Ok(())
}
