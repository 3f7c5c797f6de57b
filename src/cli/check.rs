//! Offline gate commands: `check` and `sanitize`.

use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::safety::{ChatType, CommandVerdict, PatternStore, SecurityGate};

fn gate(config: &Config) -> anyhow::Result<SecurityGate> {
    let patterns = PatternStore::from_optional_path(config.safety.patterns_file.clone())?;
    Ok(SecurityGate::new(
        std::sync::Arc::new(patterns),
        &config.safety.workspace_root,
    ))
}

fn describe(verdict: &CommandVerdict, chat: ChatType) -> String {
    let reason = verdict.reason.as_deref().unwrap_or("-");
    match (verdict.blocked, verdict.dangerous) {
        (true, true) => format!("BLOCKED in {} chat (dangerous: {})", chat, reason),
        (true, false) => format!("BLOCKED: {}", reason),
        (false, true) => format!("ALLOWED in {} chat, dangerous: {}", chat, reason),
        (false, false) => "ALLOWED".to_string(),
    }
}

/// Print the verdict for a command.
pub fn run_check_command(config: &Config, command: &str, chat: ChatType) -> anyhow::Result<()> {
    let verdict = gate(config)?.classify(command, chat);
    println!("{}", describe(&verdict, chat));
    Ok(())
}

/// Copy stdin to stdout with secrets redacted.
pub async fn run_sanitize_command(config: &Config) -> anyhow::Result<()> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    print!("{}", gate(config)?.sanitize_output(&input));
    Ok(())
}
