use anyhow::Result;
use clap::Args;

use super::GlobalOpts;

#[derive(Args)]
pub struct StatusArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatusArgs, ctx: &GlobalOpts) -> Result<()> {
    let config = ctx.load_config()?;
    let service = ctx.open_service(&config)?;
    let status = service.status();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        let f = status.features;
        let flag = |on: bool| if on { "on" } else { "off" };

        println!("docguard status");
        println!("===============");
        println!();
        println!("Mode:              {}", status.mode);
        println!("Encryption key:    {}", if status.encryption_available { "loaded" } else { "none" });
        println!(
            "Secure log:        {}",
            status.log_file.as_ref().map_or("(memory only)".into(), |p| p.display().to_string())
        );
        println!(
            "Audit log:         {}",
            status.audit_log.as_ref().map_or("(none)".into(), |p| p.display().to_string())
        );
        println!();
        println!("Features");
        println!("  injection filtering: {}", flag(f.injection_prevention));
        println!("  PII filtering:       {}", flag(f.pii_filtering));
        println!("  message sanitizing:  {}", flag(f.sanitize_messages));
        println!("  rate limiting:       {}", flag(f.rate_limiting));
        println!("  encryption:          {}", flag(f.encrypt_sensitive));
        println!("  integrity chain:     {}", flag(f.integrity));
        println!("  audit:               {}", flag(f.audit));
        println!("  anomaly detection:   {}", flag(f.anomaly_detection));
        println!("  stack traces:        {}", flag(f.keep_stack_traces));
        println!("  caching:             {}", flag(f.caching));
        println!("  buffered writes:     {}", flag(f.buffered_io));
    }

    service.shutdown().await?;
    Ok(())
}
