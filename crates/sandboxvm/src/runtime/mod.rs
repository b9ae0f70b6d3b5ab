//! Runtime adapter module.
//!
//! Everything above this module talks to isolated instances through the
//! [`RuntimeAdapter`] trait. Two backends implement it:
//!
//! - [`ContainerRuntime`]: Docker or Podman driven through their CLI.
//! - [`LocalRuntime`]: host process sandboxes for development and tests.
//!
//! The backend is chosen from configuration by [`build_runtime`].

mod container;
mod error;
mod local;
mod output;
mod spec;

pub use container::{ContainerRuntime, RuntimeType};
pub use error::{ErrorClass, RuntimeError, RuntimeResult};
pub use local::LocalRuntime;
pub use spec::{
    InstanceSpec, MANAGED_LABEL, SESSION_LABEL, validate_image_name, validate_name_prefix,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

/// Opaque reference to one runtime instance (container ID or sandbox name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observed state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Created but never started.
    Created,
    /// Running and able to execute commands.
    Running,
    /// Exited or stopped; still present.
    Stopped,
    /// No such instance.
    Missing,
    /// Anything else the runtime reports (paused, restarting, dead, ...).
    Unknown(String),
}

impl InstanceState {
    /// Map a docker/podman `State.Status` string.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "created" | "configured" | "initialized" => InstanceState::Created,
            "running" => InstanceState::Running,
            "exited" | "stopped" => InstanceState::Stopped,
            other => InstanceState::Unknown(other.to_string()),
        }
    }
}

/// An instance carrying the managed label, as listed by the backend.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    pub handle: InstanceHandle,
    /// Owning session id recovered from the instance label or name.
    pub session_id: Option<String>,
    pub state: InstanceState,
}

/// One command execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Shell command line, run with `sh -c`.
    pub command: String,
    /// Wall-clock budget; the command is killed when it runs out.
    pub timeout: Duration,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
}

/// Raw result of an execution as seen by the backend.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed before reporting a status.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Docker or Podman containers.
    #[default]
    Container,
    /// Host process sandboxes (no resource isolation).
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" => Ok(BackendKind::Container),
            "local" => Ok(BackendKind::Local),
            _ => Err(format!("unknown runtime backend: {}", s)),
        }
    }
}

/// Runtime abstraction over the virtualization technology.
///
/// All calls may block on I/O. Callers hold only the per-session execution
/// lock while awaiting them.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Create an instance (not yet started).
    async fn create(&self, spec: &InstanceSpec) -> RuntimeResult<InstanceHandle>;

    /// Start a created instance.
    async fn start(&self, handle: &InstanceHandle) -> RuntimeResult<()>;

    /// Run a command inside a running instance, enforcing the request bounds.
    async fn exec(&self, handle: &InstanceHandle, request: &ExecRequest)
    -> RuntimeResult<ExecOutput>;

    /// Stop a running instance.
    async fn stop(&self, handle: &InstanceHandle) -> RuntimeResult<()>;

    /// Remove an instance and everything it owns.
    async fn destroy(&self, handle: &InstanceHandle) -> RuntimeResult<()>;

    /// Report the current state; `Missing` if it no longer exists.
    async fn inspect(&self, handle: &InstanceHandle) -> RuntimeResult<InstanceState>;

    /// List every instance tagged as managed by this service.
    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedInstance>>;

    /// Check that the backend is usable.
    async fn health_check(&self) -> RuntimeResult<String>;
}

/// Build the configured backend.
pub fn build_runtime(config: &RuntimeConfig) -> RuntimeResult<Arc<dyn RuntimeAdapter>> {
    match config.backend {
        BackendKind::Container => {
            let container = &config.container;
            validate_image_name(&container.image)?;
            let runtime = match (container.runtime, container.binary.as_ref()) {
                (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
                (Some(rt), None) => ContainerRuntime::with_type(rt),
                (None, _) => ContainerRuntime::new(),
            };
            Ok(Arc::new(
                runtime
                    .with_settings(container.clone())
                    .with_name_prefix(config.name_prefix.clone()),
            ))
        }
        BackendKind::Local => Ok(Arc::new(LocalRuntime::new(&config.local.base_dir)?)),
    }
}
