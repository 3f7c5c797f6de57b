//! `shellcage serve`: sandbox manager plus HTTP API until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Args;

use crate::config::Config;
use crate::error::ConfigError;
use crate::executor::CommandExecutor;
use crate::safety::{PatternStore, SecurityGate};
use crate::sandbox::config::FallbackPolicy;
use crate::sandbox::manager::SandboxManager;
use crate::server::{ApiServer, router};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides SHELLCAGE_BIND)
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Serve the API without bearer-token authentication
    #[arg(long)]
    pub insecure: bool,
}

pub async fn run_serve_command(config: Config, args: ServeArgs) -> anyhow::Result<()> {
    let token = match (config.server.auth_token.clone(), args.insecure) {
        (Some(token), _) => Some(token),
        (None, true) => None,
        (None, false) => {
            return Err(ConfigError::MissingRequired {
                key: "SHELLCAGE_AUTH_TOKEN".to_string(),
                hint: "Set it, or pass --insecure to serve without authentication".to_string(),
            }
            .into());
        }
    };

    let patterns = Arc::new(PatternStore::from_optional_path(
        config.safety.patterns_file.clone(),
    )?);
    let gate = Arc::new(SecurityGate::new(patterns, &config.safety.workspace_root));

    let manager = Arc::new(SandboxManager::connect(config.sandbox.clone()).await);
    if !manager.start().await {
        match config.executor.fallback {
            FallbackPolicy::Deny => {
                tracing::warn!("Sandbox unavailable, commands will be refused");
            }
            FallbackPolicy::Local => {
                tracing::warn!("Sandbox unavailable, commands will run on the host");
            }
        }
    }

    let executor = Arc::new(CommandExecutor::new(
        gate,
        Arc::clone(&manager),
        config.executor,
    ));
    let addr = args.bind.unwrap_or(config.server.bind);
    let mut server = ApiServer::new(addr, router(executor, token));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");

    server.shutdown().await;
    manager.shutdown().await;
    Ok(())
}
