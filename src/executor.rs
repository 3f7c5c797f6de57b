//! Execution Protocol: classify, run in the sandbox, sanitize.
//!
//! ```text
//! run_command ─▶ SecurityGate::classify ─▶ SandboxManager::execute ─▶ sanitize
//!                     │ blocked                  │ runtime unavailable
//!                     ▼                          ▼
//!               "🚫 BLOCKED: …"           FallbackPolicy (deny | local)
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::safety::{ChatType, PathCheck, SecurityGate};
use crate::sandbox::config::FallbackPolicy;
use crate::sandbox::manager::{ExecutionResult, SandboxManager, truncate_output, validate_user_id};

/// `PATH` given to commands run by the local fallback.
const LOCAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// One command to run for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub user_id: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ExecutionRequest {
    pub fn new(user_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Whether the file-tool layer may touch a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileAccess {
    Allowed { path: PathBuf },
    Denied { reason: String },
}

impl FileAccess {
    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Runs agent commands through the gate and the sandbox.
pub struct CommandExecutor {
    gate: Arc<SecurityGate>,
    sandbox: Arc<SandboxManager>,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(gate: Arc<SecurityGate>, sandbox: Arc<SandboxManager>, config: ExecutorConfig) -> Self {
        Self {
            gate,
            sandbox,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn sandbox(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    /// Classify and run a command for a user.
    pub async fn run_command(&self, request: &ExecutionRequest, chat: ChatType) -> ExecutionResult {
        if request.command.trim().is_empty() {
            return ExecutionResult::failed("Empty command", false);
        }

        let verdict = self.gate.classify(&request.command, chat);
        if verdict.blocked {
            let reason = verdict.reason.as_deref().unwrap_or("Blocked by policy");
            return ExecutionResult::failed(format!("🚫 BLOCKED: {}", reason), false);
        }

        tracing::debug!(
            user_id = %request.user_id,
            command = %self.gate.sanitize_output(&request.command),
            "Running command"
        );

        let mut result = if self.sandbox.is_available() {
            self.sandbox
                .execute(
                    &request.user_id,
                    &request.command,
                    request.working_dir.as_deref(),
                )
                .await
        } else {
            match self.config.fallback {
                FallbackPolicy::Deny => {
                    tracing::warn!(
                        user_id = %request.user_id,
                        "Sandbox unavailable, refusing unsandboxed execution"
                    );
                    ExecutionResult::failed(
                        "Sandbox unavailable: command not executed (fallback policy is deny)",
                        false,
                    )
                }
                FallbackPolicy::Local => {
                    tracing::warn!(
                        user_id = %request.user_id,
                        "Sandbox unavailable, running command on the host"
                    );
                    self.run_local(request).await
                }
            }
        };

        result.output = self.gate.sanitize_output(&result.output).into_owned();
        result
    }

    /// Run `sh -c` on the host inside the user's local workspace.
    async fn run_local(&self, request: &ExecutionRequest) -> ExecutionResult {
        if let Err(e) = validate_user_id(&request.user_id) {
            return ExecutionResult::failed(e.to_string(), false);
        }

        let workspace = self.gate.path_guard().user_workspace(&request.user_id);
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return ExecutionResult::failed(format!("Failed to prepare workspace: {}", e), false);
        }

        let cwd = match request.working_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            None => workspace.clone(),
            Some(dir) => {
                let normalized = self.gate.normalize_path(dir, &workspace);
                match self.gate.is_path_safe(&normalized, &workspace) {
                    PathCheck::Allowed { resolved } => resolved,
                    PathCheck::Denied { reason } => {
                        return ExecutionResult::failed(format!("🚫 {}", reason), false);
                    }
                }
            }
        };

        let config = self.sandbox.config();
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", LOCAL_PATH)
            .env("HOME", &workspace)
            .env("USER_ID", &request.user_id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(config.command_timeout, child).await {
            Err(_) => {
                return ExecutionResult::failed(
                    format!(
                        "Timeout: command exceeded {}s",
                        config.command_timeout.as_secs()
                    ),
                    false,
                );
            }
            Ok(Err(e)) => {
                return ExecutionResult::failed(format!("Failed to run command: {}", e), false);
            }
            Ok(Ok(output)) => output,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.trim().is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let text = truncate_output(text.trim().to_string(), config.max_output_chars);

        ExecutionResult {
            success: output.status.success(),
            output: if text.is_empty() {
                "(no output)".to_string()
            } else {
                text
            },
            sandboxed: false,
        }
    }

    /// Decide whether the file-tool layer may access `path` for `user_id`.
    pub fn check_file_access(&self, user_id: &str, path: &str) -> FileAccess {
        if let Err(e) = validate_user_id(user_id) {
            return FileAccess::denied(e.to_string());
        }

        let cwd = self.gate.path_guard().user_workspace(user_id);
        let normalized = self.gate.normalize_path(path, &cwd);

        let resolved = match self.gate.is_path_safe(&normalized, &cwd) {
            PathCheck::Allowed { resolved } => resolved,
            PathCheck::Denied { reason } => return FileAccess::denied(reason),
        };

        if self.is_sensitive(&normalized) || self.is_sensitive(&resolved) {
            return FileAccess::denied("Cannot access sensitive file");
        }

        FileAccess::Allowed { path: resolved }
    }

    fn is_sensitive(&self, path: &Path) -> bool {
        self.gate.is_sensitive_file(&path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sandbox::config::SandboxConfig;

    fn executor(fallback: FallbackPolicy, root: &Path) -> CommandExecutor {
        let gate = Arc::new(SecurityGate::with_defaults(root));
        let sandbox = Arc::new(SandboxManager::new(SandboxConfig::default(), None));
        CommandExecutor::new(gate, sandbox, ExecutorConfig { fallback })
    }

    #[tokio::test]
    async fn test_blocked_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FallbackPolicy::Local, dir.path());
        let result = exec
            .run_command(&ExecutionRequest::new("1", "cat /etc/shadow"), ChatType::Private)
            .await;
        assert!(!result.success);
        assert!(!result.sandboxed);
        assert_eq!(result.output, "🚫 BLOCKED: System file access");
    }

    #[tokio::test]
    async fn test_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FallbackPolicy::Local, dir.path());
        let result = exec
            .run_command(&ExecutionRequest::new("1", "  "), ChatType::Private)
            .await;
        assert_eq!(result.output, "Empty command");
    }

    #[tokio::test]
    async fn test_deny_fallback_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FallbackPolicy::Deny, dir.path());
        let result = exec
            .run_command(&ExecutionRequest::new("1", "echo hi"), ChatType::Private)
            .await;
        assert!(!result.success);
        assert!(!result.sandboxed);
        assert!(result.output.contains("Sandbox unavailable"));
        // Nothing was created on the host.
        assert!(!dir.path().join("1").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_fallback_runs_in_workspace_and_sanitizes() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FallbackPolicy::Local, dir.path());

        let result = exec
            .run_command(
                &ExecutionRequest::new("42", "echo token: 1234567890:ABCdefGHIjklMNOpqrSTUvwxYZ123456789"),
                ChatType::Private,
            )
            .await;
        assert!(result.success);
        assert!(!result.sandboxed);
        assert!(result.output.contains("[REDACTED]"));
        assert!(!result.output.contains("ABCdefGHI"));

        let result = exec
            .run_command(&ExecutionRequest::new("42", "pwd"), ChatType::Private)
            .await;
        assert!(result.output.ends_with("/42"), "{}", result.output);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_fallback_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(FallbackPolicy::Local, dir.path());
        let result = exec
            .run_command(&ExecutionRequest::new("42", "true"), ChatType::Private)
            .await;
        assert!(result.success);
        assert_eq!(result.output, "(no output)");

        let result = exec
            .run_command(&ExecutionRequest::new("42", "exit 3"), ChatType::Private)
            .await;
        assert!(!result.success);
    }

    #[test]
    fn test_check_file_access() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("123")).unwrap();
        let exec = executor(FallbackPolicy::Deny, &root);

        assert!(exec.check_file_access("123", "script.py").is_allowed());
        assert_eq!(
            exec.check_file_access("123", ".env"),
            FileAccess::denied("Cannot access sensitive file")
        );
        assert_eq!(
            exec.check_file_access("123", "../456/notes.txt"),
            FileAccess::denied("Path outside workspace")
        );
        assert!(!exec.check_file_access("../123", "x").is_allowed());
    }
}
