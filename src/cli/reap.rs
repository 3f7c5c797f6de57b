//! `shellcage reap`: one-shot orphan cleanup.

use crate::config::Config;
use crate::sandbox::manager::SandboxManager;

pub async fn run_reap_command(config: Config) -> anyhow::Result<()> {
    let manager = SandboxManager::connect(config.sandbox).await;
    if !manager.is_available() {
        anyhow::bail!("Docker not available");
    }
    let removed = manager.reap_orphans().await;
    println!(
        "Removed {} orphan sandbox container(s) with prefix '{}'",
        removed,
        manager.config().container_prefix
    );
    Ok(())
}
