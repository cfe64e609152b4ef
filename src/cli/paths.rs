//! CLI subcommand: `docguard paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("docguard Paths (XDG Base Directory)");
    println!("===================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  log key:        {}", paths.log_key().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!("  secure log:     {}", paths.log_file().display());

    Ok(())
}
