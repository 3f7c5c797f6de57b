//! Configuration loaded from the environment.
//!
//! `.env` is read first (via `dotenvy`), then every key falls back to the
//! defaults of the sandbox and safety modules. A value that is present but
//! unparseable is an error naming the key; nothing is silently ignored.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::sandbox::config::{FallbackPolicy, SandboxConfig};

/// Default HTTP bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1:4010";

/// Security Gate configuration.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// JSON pattern file; built-in patterns when `None`.
    pub patterns_file: Option<PathBuf>,
    /// Root holding one directory per user, as seen by this process.
    pub workspace_root: PathBuf,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            patterns_file: None,
            workspace_root: PathBuf::from("/workspace"),
        }
    }
}

/// Execution Protocol configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorConfig {
    pub fallback: FallbackPolicy,
}

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub auth_token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4010)),
            auth_token: None,
        }
    }
}

/// Full configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub safety: SafetyConfig,
    pub executor: ExecutorConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load from the process environment after reading `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = SandboxConfig::default();

        let sandbox = SandboxConfig {
            image: env.string("SANDBOX_IMAGE", &defaults.image),
            container_prefix: env.string("SANDBOX_CONTAINER_PREFIX", &defaults.container_prefix),
            workspace_host_root: env.path("WORKSPACE_HOST_PATH", &defaults.workspace_host_root),
            container_workspace_root: env
                .string("SANDBOX_WORKSPACE_ROOT", &defaults.container_workspace_root),
            network: env.optional("SANDBOX_NETWORK"),
            workspace_limit_mb: env.parse("WORKSPACE_LIMIT_MB", defaults.workspace_limit_mb)?,
            command_timeout: env.duration_secs(
                "SANDBOX_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout,
            )?,
            inactivity_ttl: env.duration_mins(
                "SANDBOX_INACTIVITY_TTL_MINS",
                defaults.inactivity_ttl,
            )?,
            cleanup_interval: env.duration_mins(
                "SANDBOX_CLEANUP_INTERVAL_MINS",
                defaults.cleanup_interval,
            )?,
            max_output_chars: env.parse("SANDBOX_MAX_OUTPUT_CHARS", defaults.max_output_chars)?,
            provision_command: env
                .raw("SANDBOX_PROVISION_COMMAND")
                .unwrap_or(defaults.provision_command.clone()),
            auto_pull_image: env.parse("SANDBOX_AUTO_PULL", defaults.auto_pull_image)?,
            ..defaults
        };

        if sandbox.container_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_CONTAINER_PREFIX".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let safety = SafetyConfig {
            patterns_file: env.optional("SECURITY_PATTERNS_FILE").map(PathBuf::from),
            workspace_root: env.path("LOCAL_WORKSPACE", &SafetyConfig::default().workspace_root),
        };

        let executor = ExecutorConfig {
            fallback: env.parse("SANDBOX_FALLBACK", FallbackPolicy::default())?,
        };

        let server = ServerConfig {
            bind: env.parse("SHELLCAGE_BIND", ServerConfig::default().bind)?,
            auth_token: env
                .optional("SHELLCAGE_AUTH_TOKEN")
                .map(SecretString::from),
        };

        Ok(Self {
            sandbox,
            safety,
            executor,
            server,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    /// Present and non-blank.
    fn optional(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn path(&self, key: &str, default: &std::path::Path) -> PathBuf {
        self.optional(key)
            .map(PathBuf::from)
            .unwrap_or_else(|| default.to_path_buf())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{:?}: {}", value, e),
            }),
        }
    }

    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.positive(key, default.as_secs()).map(Duration::from_secs)
    }

    fn duration_mins(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.positive(key, default.as_secs() / 60)
            .map(|mins| Duration::from_secs(mins * 60))
    }
}
