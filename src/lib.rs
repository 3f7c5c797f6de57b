//! Shellcage runs shell commands issued by LLM agents inside per-user
//! Docker containers, behind a security gate.
//!
//! - [`sandbox`] owns container lifecycle: one container per user, port
//!   blocks, idle sweeping, orphan reaping.
//! - [`safety`] decides whether a command may run, keeps path access inside
//!   the user's workspace, and redacts secrets from output.
//! - [`executor`] composes the two into the single entry point agents call.
//! - [`server`] exposes the executor over HTTP.

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod safety;
pub mod sandbox;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::{CommandExecutor, ExecutionRequest, FileAccess};
pub use safety::{ChatType, CommandVerdict, SecurityGate};
pub use sandbox::{ExecutionResult, SandboxManager};
