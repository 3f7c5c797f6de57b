//! Per-user Docker sandboxes for agent shell commands.
//!
//! Every user gets one long-lived container, created on first use and reused
//! until it has been idle for the inactivity TTL:
//!
//! ```text
//!  execute(user, cmd)
//!        │
//!        ▼
//!  ┌──────────────────────────────────────────────┐
//!  │ SandboxManager                               │
//!  │  • per-user lock around get-or-create        │
//!  │  • port blocks (5000..6000, 10 per user)     │
//!  │  • inactivity sweep + orphan reap            │
//!  └──────────────────────────────────────────────┘
//!        │ ContainerRuntime
//!        ▼
//!  ┌──────────────────┐     ┌──────────────────┐
//!  │ DockerRuntime    │     │ InMemoryRuntime  │
//!  │ (bollard)        │     │ (tests, dev)     │
//!  └──────────────────┘     └──────────────────┘
//! ```
//!
//! # Container policy
//!
//! - 512 MiB memory, no extra swap, half a CPU, 100 processes
//! - `no-new-privileges`
//! - exactly one bind mount: the user's workspace directory
//! - environment limited to `USER_ID`, `PORT_BASE` and `PORTS`
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shellcage::sandbox::{SandboxConfig, SandboxManager};
//!
//! # async fn example() {
//! let manager = Arc::new(SandboxManager::connect(SandboxConfig::default()).await);
//! if manager.start().await {
//!     let result = manager.execute("123456", "python3 --version", None).await;
//!     println!("{}", result.output);
//! }
//! manager.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod manager;
pub mod memory;
pub mod ports;
pub mod runtime;

pub use config::{FallbackPolicy, ResourceLimits, SandboxConfig};
pub use docker::{DockerRuntime, connect_docker};
pub use error::{Result, SandboxError};
pub use manager::{
    ContainerStats, ExecutionResult, SandboxManager, SandboxManagerBuilder, SandboxStats,
    UserContainer,
};
pub use memory::InMemoryRuntime;
pub use ports::{PortAllocator, PortBlock};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutcome};
