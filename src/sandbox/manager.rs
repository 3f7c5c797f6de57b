//! Sandbox manager: one long-lived container per user.
//!
//! Bookkeeping lives in two places: the `containers` map (user id to
//! [`UserContainer`]) and the [`PortAllocator`]. Lock order is
//! per-user mutex, then `containers`, then the allocator; neither map lock is
//! held across a runtime call.
//!
//! `get_or_create` runs under a per-user mutex so two first requests for the
//! same user cannot both try to create `<prefix><user_id>`. `stop` does not
//! take that mutex: it removes the map entry before touching the runtime, so
//! a racing `execute` sees no entry and recreates instead of using a
//! half-destroyed container.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sandbox::config::SandboxConfig;
use crate::sandbox::docker::DockerRuntime;
use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::ports::{PortAllocator, PortBlock};
use crate::sandbox::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, MANAGED_LABEL, USER_LABEL,
};

/// Limit on the workspace `du` check that follows each command.
const USAGE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Appended to output cut at `max_output_chars`.
const TRUNCATION_MARKER: &str = "\n...(truncated)";

/// A live sandbox owned by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContainer {
    pub container_id: String,
    pub user_id: String,
    pub ports: PortBlock,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl UserContainer {
    /// How long the container has been idle as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active_at).to_std().unwrap_or_default()
    }

    /// First 12 characters of the container id.
    pub fn short_id(&self) -> &str {
        short_id(&self.container_id)
    }
}

fn short_id(id: &str) -> &str {
    id.char_indices().nth(12).map_or(id, |(idx, _)| &id[..idx])
}

/// Outcome of running one command for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    /// Whether the command ran inside a sandbox container.
    pub sandboxed: bool,
}

impl ExecutionResult {
    pub fn failed(output: impl Into<String>, sandboxed: bool) -> Self {
        Self {
            success: false,
            output: output.into(),
            sandboxed,
        }
    }
}

/// Per-container line of [`SandboxStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub user_id: String,
    pub container_id_prefix: String,
    pub port_range: String,
    pub age_minutes: i64,
    pub inactive_minutes: i64,
}

/// Snapshot of every live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub active_containers: usize,
    pub containers: Vec<ContainerStats>,
}

/// Check that a user id is safe to splice into a container name, a mount
/// path and an env value.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let reason = if user_id.is_empty() {
        Some("empty".to_string())
    } else if user_id.len() > 64 {
        Some("longer than 64 characters".to_string())
    } else {
        user_id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
            .map(|c| format!("contains '{}'", c))
    };
    match reason {
        Some(reason) => Err(SandboxError::InvalidUserId {
            user_id: user_id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Whether `command` is a `df` invocation.
pub fn is_disk_usage_query(command: &str) -> bool {
    command.split_whitespace().next() == Some("df")
}

/// Cut `output` to `max_chars` characters, appending a marker when cut.
pub fn truncate_output(mut output: String, max_chars: usize) -> String {
    if let Some((idx, _)) = output.char_indices().nth(max_chars) {
        output.truncate(idx);
        output.push_str(TRUNCATION_MARKER);
    }
    output
}

struct Sweeper {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns every user's sandbox container.
pub struct SandboxManager {
    config: SandboxConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    available: AtomicBool,
    containers: RwLock<HashMap<String, UserContainer>>,
    ports: PortAllocator,
    user_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    sweeper: StdMutex<Option<Sweeper>>,
}

impl SandboxManager {
    /// Create a manager over `runtime`. `None` means sandboxing is unavailable.
    pub fn new(config: SandboxConfig, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        let available = runtime.is_some();
        Self {
            config,
            runtime,
            available: AtomicBool::new(available),
            containers: RwLock::new(HashMap::new()),
            ports: PortAllocator::new(),
            user_locks: StdMutex::new(HashMap::new()),
            sweeper: StdMutex::new(None),
        }
    }

    /// Create a manager over the local Docker daemon, degrading to
    /// "unavailable" when it cannot be reached.
    pub async fn connect(config: SandboxConfig) -> Self {
        match DockerRuntime::connect().await {
            Ok(runtime) => {
                tracing::info!("Docker client connected");
                Self::new(config, Some(Arc::new(runtime)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Docker not available");
                Self::new(config, None)
            }
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The process-wide port reservations.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Whether commands can currently be sandboxed.
    pub fn is_available(&self) -> bool {
        self.runtime.is_some() && self.available.load(Ordering::SeqCst)
    }

    fn runtime(&self) -> Result<&Arc<dyn ContainerRuntime>> {
        match &self.runtime {
            Some(runtime) if self.available.load(Ordering::SeqCst) => Ok(runtime),
            Some(_) => Err(SandboxError::DockerNotAvailable {
                reason: "runtime failed its startup check".to_string(),
            }),
            None => Err(SandboxError::DockerNotAvailable {
                reason: "no container runtime configured".to_string(),
            }),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id.to_string()).or_default().clone()
    }

    /// Verify the runtime, ensure the image, reap orphans and start the
    /// inactivity sweep. Returns whether sandboxing is enabled.
    pub async fn start(self: &Arc<Self>) -> bool {
        let Some(runtime) = self.runtime.clone() else {
            tracing::warn!("Docker not available! Running without sandbox.");
            return false;
        };

        if let Err(e) = runtime.ping().await {
            tracing::warn!(error = %e, "Container runtime did not answer, sandbox disabled");
            self.available.store(false, Ordering::SeqCst);
            return false;
        }

        let image_ready = if self.config.auto_pull_image {
            runtime.ensure_image(&self.config.image).await
        } else {
            match runtime.has_image(&self.config.image).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(SandboxError::DockerNotAvailable {
                    reason: format!("image {} not present and auto-pull disabled", self.config.image),
                }),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = image_ready {
            tracing::error!(image = %self.config.image, error = %e, "Sandbox image unavailable, sandbox disabled");
            self.available.store(false, Ordering::SeqCst);
            return false;
        }

        self.available.store(true, Ordering::SeqCst);
        self.reap_orphans().await;
        self.spawn_sweeper();

        tracing::info!(
            backend = runtime.backend_name(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            ttl_secs = self.config.inactivity_ttl.as_secs(),
            "Sandbox manager started"
        );
        true
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let manager = Arc::downgrade(self);
        let period = self.config.cleanup_interval.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep_inactive().await;
                    }
                }
            }
            tracing::debug!("Sandbox sweep loop stopped");
        });

        *slot = Some(Sweeper {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the sweep loop and remove every live container.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sandbox manager");

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown_tx.send(());
            let _ = sweeper.handle.await;
        }

        let users: Vec<String> = self.containers.read().await.keys().cloned().collect();
        for user_id in users {
            self.stop(&user_id).await;
        }
    }

    /// Return the user's running sandbox, creating one if needed.
    pub async fn get_or_create(&self, user_id: &str) -> Result<UserContainer> {
        let runtime = Arc::clone(self.runtime()?);
        validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let existing = self.containers.read().await.get(user_id).cloned();
        if let Some(existing) = existing {
            match runtime.status(&existing.container_id).await? {
                ContainerStatus::Running => {
                    if let Some(container) = self.touch(user_id).await {
                        return Ok(container);
                    }
                    // Stopped while we checked; build a fresh one.
                }
                status => {
                    tracing::info!(
                        user_id,
                        container = existing.short_id(),
                        ?status,
                        "Sandbox no longer running, recreating"
                    );
                    self.forget(user_id, &existing.container_id).await;
                }
            }
        }

        let block = self.ports.allocate(user_id).ok_or_else(|| {
            tracing::error!(user_id, "No free port ranges available");
            SandboxError::NoFreePorts {
                slots: self.ports.reserved_count(),
            }
        })?;

        match self.create_container(runtime.as_ref(), user_id, block).await {
            Ok(container) => {
                self.containers
                    .write()
                    .await
                    .insert(user_id.to_string(), container.clone());
                Ok(container)
            }
            Err(e) => {
                self.ports.release(block);
                tracing::error!(user_id, error = %e, "Failed to create sandbox");
                Err(e)
            }
        }
    }

    fn container_spec(&self, user_id: &str, block: PortBlock) -> ContainerSpec {
        let workspace = self.config.container_workspace(user_id);
        let ports = block
            .ports()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        ContainerSpec {
            name: self.config.container_name(user_id),
            image: self.config.image.clone(),
            working_dir: workspace.clone(),
            env: vec![
                ("USER_ID".to_string(), user_id.to_string()),
                ("PORT_BASE".to_string(), block.base().to_string()),
                ("PORTS".to_string(), ports),
            ],
            mount_source: self.config.host_workspace(user_id).display().to_string(),
            mount_target: workspace,
            ports: block,
            limits: self.config.limits.clone(),
            network: self.config.network.clone(),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (USER_LABEL.to_string(), user_id.to_string()),
            ]),
        }
    }

    async fn create_container(
        &self,
        runtime: &dyn ContainerRuntime,
        user_id: &str,
        block: PortBlock,
    ) -> Result<UserContainer> {
        let spec = self.container_spec(user_id, block);

        // A previous process may have left a container under the same name.
        if let Err(e) = runtime.remove(&spec.name, 1).await {
            tracing::warn!(container = %spec.name, error = %e, "Failed to remove old container");
        }

        tracing::info!(user_id, ports = %block, "Creating sandbox");
        let container_id = runtime.create(&spec).await?;

        if let Err(e) = self.provision(runtime, &container_id).await {
            let _ = runtime.remove(&container_id, 0).await;
            return Err(e);
        }

        let now = Utc::now();
        let container = UserContainer {
            container_id,
            user_id: user_id.to_string(),
            ports: block,
            created_at: now,
            last_active_at: now,
        };
        tracing::info!(user_id, container = container.short_id(), "Sandbox ready");
        Ok(container)
    }

    async fn provision(&self, runtime: &dyn ContainerRuntime, container_id: &str) -> Result<()> {
        let command = self.config.provision_command.trim();
        if command.is_empty() {
            return Ok(());
        }

        let exec = runtime.exec(
            container_id,
            command,
            &self.config.container_workspace_root,
        );
        match tokio::time::timeout(self.config.provision_timeout, exec).await {
            Err(_) => Err(SandboxError::Timeout(self.config.provision_timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(outcome)) => {
                if outcome.exit_code != 0 {
                    tracing::warn!(
                        container = short_id(container_id),
                        exit_code = outcome.exit_code,
                        "Sandbox provisioning failed, continuing with bare image"
                    );
                }
                Ok(())
            }
        }
    }

    /// Refresh `last_active_at`, returning the updated entry.
    async fn touch(&self, user_id: &str) -> Option<UserContainer> {
        let mut containers = self.containers.write().await;
        let entry = containers.get_mut(user_id)?;
        entry.last_active_at = Utc::now();
        Some(entry.clone())
    }

    /// Mark a user active without running anything.
    pub async fn mark_active(&self, user_id: &str) {
        self.touch(user_id).await;
    }

    /// Drop a stale entry if it still refers to `container_id`.
    async fn forget(&self, user_id: &str, container_id: &str) {
        let removed = {
            let mut containers = self.containers.write().await;
            match containers.get(user_id) {
                Some(entry) if entry.container_id == container_id => containers.remove(user_id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.ports.release(entry.ports);
        }
    }

    /// The user's current entry, if any.
    pub async fn container_for(&self, user_id: &str) -> Option<UserContainer> {
        self.containers.read().await.get(user_id).cloned()
    }

    /// Run a command in the user's sandbox.
    pub async fn execute(
        &self,
        user_id: &str,
        command: &str,
        working_dir: Option<&str>,
    ) -> ExecutionResult {
        let runtime = match self.runtime() {
            Ok(runtime) => Arc::clone(runtime),
            Err(_) => {
                return ExecutionResult::failed(
                    "Docker not available - running without sandbox",
                    false,
                );
            }
        };

        let container = match self.get_or_create(user_id).await {
            Ok(container) => container,
            Err(e) => {
                return ExecutionResult::failed(
                    format!("Failed to create sandbox container: {}", e),
                    false,
                );
            }
        };

        let workspace = self.config.container_workspace(user_id);
        let work_dir = working_dir
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or(&workspace);

        let actual_command = if is_disk_usage_query(command) {
            format!(
                "echo \"Workspace: $(du -sh {} 2>/dev/null | cut -f1) / {}MB limit\"",
                workspace, self.config.workspace_limit_mb
            )
        } else {
            command.to_string()
        };

        let exec = runtime.exec(&container.container_id, &actual_command, work_dir);
        let outcome = match tokio::time::timeout(self.config.command_timeout, exec).await {
            Err(_) => {
                tracing::warn!(
                    user_id,
                    timeout_secs = self.config.command_timeout.as_secs(),
                    "Sandboxed command timed out"
                );
                return ExecutionResult::failed(
                    format!(
                        "Timeout: command exceeded {}s",
                        self.config.command_timeout.as_secs()
                    ),
                    true,
                );
            }
            Ok(Err(e)) => {
                tracing::error!(user_id, error = %e, "Sandbox error");
                return ExecutionResult::failed(format!("Sandbox error: {}", e), false);
            }
            Ok(Ok(outcome)) => outcome,
        };

        self.touch(user_id).await;

        let mut output = outcome.output.trim().to_string();
        if let Some(warning) = self
            .workspace_warning(runtime.as_ref(), &container.container_id, &workspace)
            .await
        {
            if !output.is_empty() {
                output.push_str("\n\n");
            }
            output.push_str(&warning);
        }

        let output = truncate_output(output, self.config.max_output_chars);
        ExecutionResult {
            success: outcome.exit_code == 0,
            output: if output.is_empty() {
                "(no output)".to_string()
            } else {
                output
            },
            sandboxed: true,
        }
    }

    /// Warning line when the workspace exceeds its soft quota.
    async fn workspace_warning(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        workspace: &str,
    ) -> Option<String> {
        let du_cmd = format!("du -sm {} 2>/dev/null | cut -f1", workspace);
        let usage = runtime.exec(
            container_id,
            &du_cmd,
            &self.config.container_workspace_root,
        );
        let outcome = tokio::time::timeout(USAGE_CHECK_TIMEOUT, usage)
            .await
            .ok()?
            .ok()?;
        if outcome.exit_code != 0 {
            return None;
        }
        let size_mb: u64 = outcome.output.trim().parse().ok()?;
        (size_mb > self.config.workspace_limit_mb).then(|| {
            format!(
                "⚠️ Workspace: {}MB / {}MB (limit exceeded!)",
                size_mb, self.config.workspace_limit_mb
            )
        })
    }

    /// Stop and remove a user's sandbox. Idempotent; never fails.
    pub async fn stop(&self, user_id: &str) {
        let entry = self.containers.write().await.remove(user_id);
        if let Some(entry) = entry {
            self.teardown(entry).await;
        }
    }

    async fn teardown(&self, entry: UserContainer) {
        if let Some(runtime) = &self.runtime {
            let grace = self.config.stop_timeout.as_secs() as i64;
            match runtime.remove(&entry.container_id, grace).await {
                Ok(()) => {
                    tracing::info!(user_id = %entry.user_id, container = entry.short_id(), "Removed sandbox");
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(user_id = %entry.user_id, "Sandbox already gone");
                }
                Err(e) => {
                    tracing::warn!(user_id = %entry.user_id, error = %e, "Failed to remove sandbox");
                }
            }
        }

        // A request may have recreated the sandbox while the remove was in
        // flight; the new container inherits this block and keeps it.
        let lock = self.user_lock(&entry.user_id);
        let _guard = lock.lock().await;
        let inherited = self
            .containers
            .read()
            .await
            .get(&entry.user_id)
            .is_some_and(|live| live.ports == entry.ports);
        if !inherited {
            self.ports.release(entry.ports);
        }
    }

    /// Remove every sandbox idle for longer than the inactivity TTL.
    pub async fn sweep_inactive(&self) -> Vec<String> {
        self.sweep_inactive_at(Utc::now()).await
    }

    /// [`sweep_inactive`](Self::sweep_inactive) against an explicit clock.
    pub async fn sweep_inactive_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = self.config.inactivity_ttl;

        // Check and remove under one write lock so a concurrent touch either
        // lands first (and the entry survives) or finds no entry.
        let expired: Vec<UserContainer> = {
            let mut containers = self.containers.write().await;
            let idle: Vec<String> = containers
                .iter()
                .filter(|(_, c)| c.idle_for(now) > ttl)
                .map(|(user_id, _)| user_id.clone())
                .collect();
            idle.iter()
                .filter_map(|user_id| containers.remove(user_id))
                .collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for entry in expired {
            tracing::info!(
                user_id = %entry.user_id,
                inactive_minutes = entry.idle_for(now).as_secs() / 60,
                "Sandbox inactive, removing"
            );
            removed.push(entry.user_id.clone());
            self.teardown(entry).await;
        }

        self.user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        removed
    }

    /// Force-remove sandbox containers left behind by a previous process.
    pub async fn reap_orphans(&self) -> usize {
        let Ok(runtime) = self.runtime() else {
            return 0;
        };

        let found = match runtime.list_by_prefix(&self.config.container_prefix).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list orphan sandboxes");
                return 0;
            }
        };

        let tracked: HashSet<String> = self
            .containers
            .read()
            .await
            .values()
            .map(|c| c.container_id.clone())
            .collect();
        let orphans: Vec<_> = found
            .into_iter()
            .filter(|c| !tracked.contains(&c.id))
            .collect();
        if orphans.is_empty() {
            return 0;
        }

        tracing::info!(count = orphans.len(), "Found orphan sandboxes, cleaning up");
        let mut removed = 0;
        for orphan in orphans {
            match runtime.remove(&orphan.id, 1).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::debug!(container = %orphan.name, error = %e, "Failed to remove orphan");
                }
            }
        }
        tracing::info!(removed, "Orphan sandboxes cleaned");
        removed
    }

    /// Statistics for the admin surface.
    pub async fn stats(&self) -> SandboxStats {
        let now = Utc::now();
        let mut containers: Vec<ContainerStats> = self
            .containers
            .read()
            .await
            .values()
            .map(|c| ContainerStats {
                user_id: c.user_id.clone(),
                container_id_prefix: c.short_id().to_string(),
                port_range: c.ports.to_string(),
                age_minutes: (now - c.created_at).num_minutes(),
                inactive_minutes: (now - c.last_active_at).num_minutes(),
            })
            .collect();
        containers.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        SandboxStats {
            active_containers: containers.len(),
            containers,
        }
    }
}

/// Builder for [`SandboxManager`].
#[derive(Default)]
pub struct SandboxManagerBuilder {
    config: SandboxConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl SandboxManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn inactivity_ttl(mut self, ttl: Duration) -> Self {
        self.config.inactivity_ttl = ttl;
        self
    }

    pub fn build(self) -> SandboxManager {
        SandboxManager::new(self.config, self.runtime)
    }
}
