//! [`ContainerRuntime`] backed by the Docker Engine API via bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;

use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecOutcome,
};

/// Connect to the local Docker daemon and check that it answers.
pub async fn connect_docker() -> Result<Docker> {
    let docker =
        Docker::connect_with_local_defaults().map_err(|e| SandboxError::DockerNotAvailable {
            reason: e.to_string(),
        })?;
    docker
        .ping()
        .await
        .map_err(|e| SandboxError::DockerNotAvailable {
            reason: e.to_string(),
        })?;
    Ok(docker)
}

/// Docker-backed container runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect with local defaults (socket or `DOCKER_HOST`).
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }
}

/// Host configuration for a sandbox: limits, the single bind mount, ports.
pub fn host_config(spec: &ContainerSpec) -> HostConfig {
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .ports
        .ports()
        .into_iter()
        .map(|port| {
            (
                format!("{}/tcp", port),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            )
        })
        .collect();

    HostConfig {
        binds: Some(vec![format!(
            "{}:{}:rw",
            spec.mount_source, spec.mount_target
        )]),
        port_bindings: Some(port_bindings),
        memory: Some(spec.limits.memory_bytes),
        memory_swap: Some(spec.limits.memory_swap_bytes),
        cpu_period: Some(spec.limits.cpu_period),
        cpu_quota: Some(spec.limits.cpu_quota),
        pids_limit: Some(spec.limits.pids_limit),
        security_opt: Some(spec.limits.security_opts.clone()),
        network_mode: spec.network.clone(),
        ..HostConfig::default()
    }
}

/// Full create-container body for a sandbox.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .ports()
        .into_iter()
        .map(|port| (format!("{}/tcp", port), HashMap::new()))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        working_dir: Some(spec.working_dir.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config(spec)),
        ..Config::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::DockerNotAvailable {
                reason: e.to_string(),
            })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.has_image(image).await? {
            tracing::info!(image, "Sandbox image ready");
            return Ok(());
        }

        tracing::info!(image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = std::pin::pin!(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                tracing::debug!(image, status = %status, "Pull progress");
            }
        }
        tracing::info!(image, "Sandbox image pulled");
        Ok(())
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| SandboxError::ContainerCreationFailed {
                reason: e.to_string(),
            })?;

        for warning in &created.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Leave nothing half-made behind.
            let _ = self.remove(&created.id, 0).await;
            return Err(SandboxError::ContainerStartFailed {
                reason: e.to_string(),
            });
        }

        Ok(created.id)
    }

    async fn status(&self, id: &str) -> Result<ContainerStatus> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                Ok(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::Missing),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, id: &str, command: &str, working_dir: &str) -> Result<ExecOutcome> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec!["sh", "-c", command]),
                    working_dir: Some(working_dir),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::ContainerNotFound(id.to_string()),
                e => e.into(),
            })?;

        let mut output = String::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::ExecutionFailed {
                    reason: "exec started detached, no output stream".to_string(),
                });
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn remove(&self, id: &str, stop_timeout_secs: i64) -> Result<()> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: stop_timeout_secs,
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(()),
            // 304: already stopped. Anything else, the force-remove still applies.
            Err(e) => tracing::debug!(container = id, error = %e, "Stop before remove failed"),
        }

        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        // The name filter is a substring match; keep true prefix matches only.
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                Some(ContainerSummary { id, name })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sandbox::config::ResourceLimits;
    use crate::sandbox::ports::preferred_block;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandbox_123456".to_string(),
            image: "python:3.11-slim".to_string(),
            working_dir: "/workspace/123456".to_string(),
            env: vec![
                ("USER_ID".to_string(), "123456".to_string()),
                ("PORT_BASE".to_string(), "5560".to_string()),
            ],
            mount_source: "/srv/workspace/123456".to_string(),
            mount_target: "/workspace/123456".to_string(),
            ports: preferred_block("123456"),
            limits: ResourceLimits::default(),
            network: Some("agent-net".to_string()),
            labels: HashMap::from([("shellcage.managed".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_host_config_resource_policy() {
        let host = host_config(&spec());
        assert_eq!(host.memory, Some(536_870_912));
        assert_eq!(host.memory_swap, Some(536_870_912));
        assert_eq!(host.pids_limit, Some(100));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert!(
            host.security_opt
                .unwrap()
                .contains(&"no-new-privileges".to_string())
        );
        assert_eq!(host.network_mode.as_deref(), Some("agent-net"));
    }

    #[test]
    fn test_host_config_single_bind_mount() {
        let host = host_config(&spec());
        assert_eq!(
            host.binds.unwrap(),
            vec!["/srv/workspace/123456:/workspace/123456:rw".to_string()]
        );
    }

    #[test]
    fn test_host_config_publishes_whole_block() {
        let host = host_config(&spec());
        let bindings = host.port_bindings.unwrap();
        assert_eq!(bindings.len(), 10);
        for port in 5560..=5569u16 {
            let binding = bindings
                .get(&format!("{}/tcp", port))
                .and_then(|b| b.as_ref())
                .and_then(|b| b.first())
                .unwrap();
            assert_eq!(binding.host_port.as_deref(), Some(port.to_string().as_str()));
        }
    }

    #[test]
    fn test_container_config_env_matches_allow_list() {
        let config = container_config(&spec());
        assert_eq!(
            config.env.unwrap(),
            vec!["USER_ID=123456".to_string(), "PORT_BASE=5560".to_string()]
        );
        assert_eq!(config.working_dir.as_deref(), Some("/workspace/123456"));
        assert_eq!(
            config.cmd.unwrap(),
            vec!["sleep".to_string(), "infinity".to_string()]
        );
        assert_eq!(config.exposed_ports.unwrap().len(), 10);
    }
}
