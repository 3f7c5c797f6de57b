//! The seam between the sandbox manager and a container runtime.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::sandbox::config::ResourceLimits;
use crate::sandbox::error::Result;
use crate::sandbox::ports::PortBlock;

/// Label set on every container the manager creates.
pub const MANAGED_LABEL: &str = "shellcage.managed";
/// Label carrying the owning user id.
pub const USER_LABEL: &str = "shellcage.user";

/// Everything needed to create one user's sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Environment, exactly as passed to the container.
    pub env: Vec<(String, String)>,
    /// Host path mounted read/write at `mount_target`.
    pub mount_source: String,
    pub mount_target: String,
    /// Published ports, each bound to the same host port.
    pub ports: PortBlock,
    pub limits: ResourceLimits,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Look up an env var by name.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Live status of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Missing,
}

/// Result of one command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i64,
    /// Interleaved stdout and stderr.
    pub output: String,
}

/// A container found while listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
}

/// Operations the sandbox manager needs from a container runtime.
///
/// Implementations must be cheap to share: the manager holds one behind an
/// `Arc` and calls it from many tasks at once.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable backend name.
    fn backend_name(&self) -> &'static str;

    /// Check that the runtime answers.
    async fn ping(&self) -> Result<()>;

    /// Make sure `image` is present locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Whether `image` is present locally. Never pulls.
    async fn has_image(&self, image: &str) -> Result<bool>;

    /// Create and start a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Inspect a container by id or name.
    async fn status(&self, id: &str) -> Result<ContainerStatus>;

    /// Run `sh -c <command>` in `working_dir` and wait for it to finish.
    async fn exec(&self, id: &str, command: &str, working_dir: &str) -> Result<ExecOutcome>;

    /// Stop (with a grace period in seconds) and force-remove a container.
    ///
    /// A container that no longer exists is not an error.
    async fn remove(&self, id: &str, stop_timeout_secs: i64) -> Result<()>;

    /// All containers, running or not, whose name starts with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerSummary>>;
}
