//! In-process [`ContainerRuntime`] for tests and local development.
//!
//! Containers are entries in a map; `exec` understands a handful of shell
//! shapes (`echo`, `sleep N`, `exit N`, the workspace `du` check) and answers
//! everything else with exit code 0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecOutcome,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    running: bool,
    spec: Option<ContainerSpec>,
}

/// A command seen by [`InMemoryRuntime::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container_id: String,
    pub command: String,
    pub working_dir: String,
}

/// Map-backed runtime.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    execs: Mutex<Vec<ExecRecord>>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
    fail_create: AtomicBool,
    workspace_mb: AtomicU64,
    image_missing: AtomicBool,
    remove_delay_ms: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make `create` fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Size reported by the workspace `du -sm` check.
    pub fn set_workspace_mb(&self, mb: u64) {
        self.workspace_mb.store(mb, Ordering::SeqCst);
    }

    /// Report the image as absent; `ensure_image` still "pulls" it.
    pub fn set_image_missing(&self, missing: bool) {
        self.image_missing.store(missing, Ordering::SeqCst);
    }

    /// Delay every `remove` call, as a slow `docker stop` would.
    pub fn set_remove_delay(&self, delay: Duration) {
        self.remove_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Register a container that was not created through this runtime,
    /// e.g. one left over by a previous process.
    pub async fn insert_external(&self, name: &str, running: bool) -> String {
        let id = self.fresh_id();
        self.containers.lock().await.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                running,
                spec: None,
            },
        );
        id
    }

    /// Simulate a crash: the container stays but stops running.
    pub async fn kill(&self, id: &str) {
        if let Some(container) = self.containers.lock().await.get_mut(id) {
            container.running = false;
        }
    }

    /// Simulate an out-of-band `docker rm`.
    pub async fn forget(&self, id: &str) {
        self.containers.lock().await.remove(id);
    }

    /// Spec a container was created with.
    pub async fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .await
            .get(id)
            .and_then(|c| c.spec.clone())
    }

    /// Ids of all containers that currently exist.
    pub async fn container_ids(&self) -> Vec<String> {
        self.containers.lock().await.keys().cloned().collect()
    }

    /// Every command executed so far.
    pub async fn exec_log(&self) -> Vec<ExecRecord> {
        self.execs.lock().await.clone()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed_count(&self) -> u64 {
        self.removed.load(Ordering::SeqCst)
    }

    fn fresh_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{:064x}", n)
    }

    async fn run(&self, command: &str) -> ExecOutcome {
        let trimmed = command.trim();

        if let Some(secs) = trimmed.strip_prefix("sleep ") {
            let secs: f64 = secs.trim().parse().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            return ExecOutcome {
                exit_code: 0,
                output: String::new(),
            };
        }
        if let Some(code) = trimmed.strip_prefix("exit ") {
            return ExecOutcome {
                exit_code: code.trim().parse().unwrap_or(1),
                output: String::new(),
            };
        }
        if trimmed.starts_with("du -sm ") {
            return ExecOutcome {
                exit_code: 0,
                output: format!("{}\n", self.workspace_mb.load(Ordering::SeqCst)),
            };
        }
        if let Some(text) = trimmed.strip_prefix("echo ") {
            return ExecOutcome {
                exit_code: 0,
                output: format!("{}\n", text.trim_matches(|c| c == '\'' || c == '"')),
            };
        }
        ExecOutcome {
            exit_code: 0,
            output: String::new(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SandboxError::DockerNotAvailable {
                reason: "in-memory runtime marked unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<()> {
        self.ping().await?;
        self.image_missing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_image(&self, _image: &str) -> Result<bool> {
        self.ping().await?;
        Ok(!self.image_missing.load(Ordering::SeqCst))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::ContainerCreationFailed {
                reason: "in-memory runtime refused to create".to_string(),
            });
        }
        let mut containers = self.containers.lock().await;
        if containers.values().any(|c| c.name == spec.name) {
            return Err(SandboxError::ContainerCreationFailed {
                reason: format!("name {} already in use", spec.name),
            });
        }
        let id = self.fresh_id();
        containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                running: true,
                spec: Some(spec.clone()),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn status(&self, id: &str) -> Result<ContainerStatus> {
        Ok(match self.containers.lock().await.get(id) {
            Some(c) if c.running => ContainerStatus::Running,
            Some(_) => ContainerStatus::Stopped,
            None => ContainerStatus::Missing,
        })
    }

    async fn exec(&self, id: &str, command: &str, working_dir: &str) -> Result<ExecOutcome> {
        match self.containers.lock().await.get(id) {
            Some(c) if c.running => {}
            Some(_) => {
                return Err(SandboxError::ExecutionFailed {
                    reason: format!("container {} is not running", id),
                });
            }
            None => return Err(SandboxError::ContainerNotFound(id.to_string())),
        }
        self.execs.lock().await.push(ExecRecord {
            container_id: id.to_string(),
            command: command.to_string(),
            working_dir: working_dir.to_string(),
        });
        Ok(self.run(command).await)
    }

    async fn remove(&self, id: &str, _stop_timeout_secs: i64) -> Result<()> {
        let delay = self.remove_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut containers = self.containers.lock().await;
        let key = if containers.contains_key(id) {
            Some(id.to_string())
        } else {
            containers
                .iter()
                .find(|(_, c)| c.name == id)
                .map(|(k, _)| k.clone())
        };
        if let Some(key) = key {
            containers.remove(&key);
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.name.starts_with(prefix))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
            })
            .collect())
    }
}
