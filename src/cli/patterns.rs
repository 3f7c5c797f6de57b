//! `shellcage patterns`: load and report the pattern file.

use crate::config::Config;
use crate::safety::PatternStore;

pub fn run_patterns_command(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let store = PatternStore::from_optional_path(config.safety.patterns_file.clone())?;
    let set = store.snapshot();

    match store.path() {
        Some(path) => println!("Pattern file: {}", path.display()),
        None => println!("Pattern file: (built-in defaults)"),
    }
    println!("Version:      {}", set.version());
    println!("Blocked:      {}", set.blocked().len());
    println!("Dangerous:    {}", set.dangerous().len());
    println!("Sensitive:    {}", set.sensitive_files().len());
    if set.skipped() > 0 {
        println!("Skipped:      {} (malformed regex)", set.skipped());
    }

    if verbose {
        println!("\nBlocked patterns:");
        for pattern in set.blocked() {
            println!("  {:<40} {}", pattern.reason(), pattern.as_str());
        }
        println!("\nDangerous patterns:");
        for pattern in set.dangerous() {
            println!("  {:<40} {}", pattern.reason(), pattern.as_str());
        }
    }
    Ok(())
}
