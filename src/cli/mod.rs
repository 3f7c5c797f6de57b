//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the sandbox service (`serve`)
//! - Classifying a command offline (`check`)
//! - Redacting secrets from stdin (`sanitize`)
//! - Removing leftover sandbox containers (`reap`)
//! - Validating the pattern file (`patterns`)

mod check;
mod patterns;
mod reap;
mod serve;

pub use check::{run_check_command, run_sanitize_command};
pub use patterns::run_patterns_command;
pub use reap::run_reap_command;
pub use serve::{ServeArgs, run_serve_command};

use clap::{Parser, Subcommand};

use crate::safety::ChatType;

#[derive(Parser, Debug)]
#[command(name = "shellcage")]
#[command(about = "Per-user Docker sandboxes and a security gate for agent shell commands")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs as JSON lines (also enabled by LOG_FORMAT=json)
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the sandbox manager and the HTTP API
    Serve(ServeArgs),

    /// Classify a command without running it
    Check {
        /// The command line to classify
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Chat context: private, group, supergroup or channel
        #[arg(long, default_value = "private")]
        chat_type: ChatType,
    },

    /// Redact secrets from stdin and write the result to stdout
    Sanitize,

    /// Remove sandbox containers left behind by a previous process
    Reap,

    /// Load the pattern file and report what it contains
    Patterns {
        /// List every pattern with its reason
        #[arg(short, long)]
        verbose: bool,
    },
}
