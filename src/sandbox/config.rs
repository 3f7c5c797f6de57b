//! Sandbox configuration and the fixed per-container resource policy.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default sandbox image.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Default container name prefix. Orphans are recognised by it.
pub const DEFAULT_CONTAINER_PREFIX: &str = "sandbox_";

/// Tools installed into every fresh sandbox.
pub const DEFAULT_PROVISION_COMMAND: &str = "apt-get update && apt-get install -y --no-install-recommends curl git jq && rm -rf /var/lib/apt/lists/*";

/// What the executor does when no container runtime is reachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Refuse to run the command.
    #[default]
    Deny,
    /// Run the command on the host, inside the user's local workspace.
    Local,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deny" | "closed" | "none" => Ok(Self::Deny),
            "local" | "host" | "unsandboxed" => Ok(Self::Local),
            other => Err(format!(
                "unknown fallback policy '{}', expected 'deny' or 'local'",
                other
            )),
        }
    }
}

/// Resource limits applied to every sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// Memory + swap limit in bytes. Equal to `memory_bytes` so swap cannot grow.
    pub memory_swap_bytes: i64,
    /// CFS period in microseconds.
    pub cpu_period: i64,
    /// CFS quota in microseconds per period.
    pub cpu_quota: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
    /// Docker `--security-opt` values.
    pub security_opts: Vec<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        let memory = 512 * 1024 * 1024;
        Self {
            memory_bytes: memory,
            memory_swap_bytes: memory,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            pids_limit: 100,
            security_opts: vec!["no-new-privileges".to_string()],
        }
    }
}

impl ResourceLimits {
    /// Fraction of one core the container may use.
    pub fn cpu_fraction(&self) -> f64 {
        self.cpu_quota as f64 / self.cpu_period as f64
    }
}

/// Sandbox manager configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image every sandbox is created from.
    pub image: String,
    /// Prefix of every sandbox container name (`<prefix><user_id>`).
    pub container_prefix: String,
    /// Host directory holding one subdirectory per user.
    pub workspace_host_root: PathBuf,
    /// Where user directories appear inside the container.
    pub container_workspace_root: String,
    /// Docker network shared with sibling services, if any.
    pub network: Option<String>,
    /// Soft quota for a user's workspace, in MB.
    pub workspace_limit_mb: u64,
    /// Wall-clock limit per command.
    pub command_timeout: Duration,
    /// Idle time after which a sandbox is reclaimed.
    pub inactivity_ttl: Duration,
    /// How often the inactivity sweep runs.
    pub cleanup_interval: Duration,
    /// Output is truncated past this many characters.
    pub max_output_chars: usize,
    /// Shell command run once in every new container. Empty disables provisioning.
    pub provision_command: String,
    /// Limit on the provisioning step.
    pub provision_timeout: Duration,
    /// Grace period given to `docker stop` before the force-remove.
    pub stop_timeout: Duration,
    /// Resource policy for every container.
    pub limits: ResourceLimits,
    /// Whether the image is pulled at startup when it is missing.
    pub auto_pull_image: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            workspace_host_root: PathBuf::from("/workspace"),
            container_workspace_root: "/workspace".to_string(),
            network: None,
            workspace_limit_mb: 500,
            command_timeout: Duration::from_secs(120),
            inactivity_ttl: Duration::from_secs(10 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            max_output_chars: 50_000,
            provision_command: DEFAULT_PROVISION_COMMAND.to_string(),
            provision_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(5),
            limits: ResourceLimits::default(),
            auto_pull_image: true,
        }
    }
}

impl SandboxConfig {
    /// Container name for a user.
    pub fn container_name(&self, user_id: &str) -> String {
        format!("{}{}", self.container_prefix, user_id)
    }

    /// The user's workspace as seen from inside the container.
    pub fn container_workspace(&self, user_id: &str) -> String {
        format!(
            "{}/{}",
            self.container_workspace_root.trim_end_matches('/'),
            user_id
        )
    }

    /// The user's workspace on the host, i.e. the bind-mount source.
    pub fn host_workspace(&self, user_id: &str) -> PathBuf {
        self.workspace_host_root.join(user_id)
    }
}
