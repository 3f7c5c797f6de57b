use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use shellcage::cli::{
    Cli, Command, run_check_command, run_patterns_command, run_reap_command,
    run_sanitize_command, run_serve_command,
};
use shellcage::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // .env must be loaded before RUST_LOG is read.
    let config = Config::from_env()?;

    let json = cli.log_json
        || std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
    init_tracing(json);

    match cli.command {
        Command::Serve(args) => run_serve_command(config, args).await,
        Command::Check { command, chat_type } => {
            run_check_command(&config, &command.join(" "), chat_type)
        }
        Command::Sanitize => run_sanitize_command(&config).await,
        Command::Reap => run_reap_command(config).await,
        Command::Patterns { verbose } => run_patterns_command(&config, verbose),
    }
}

/// Logs go to stderr so `sanitize` and `check` keep stdout clean.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellcage=info"));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("failed to initialize logging: {e}");
    }
}
