//! Docker/Podman backend driven through the runtime CLI.
//!
//! Each session gets one container that idles on `sleep infinity`; commands
//! run through `exec ... sh -c`. The runtime is auto-detected or can be
//! configured explicitly.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::error::{RuntimeError, RuntimeResult};
use super::output::run_bounded;
use super::spec::{InstanceSpec, MANAGED_LABEL, validate_handle};
use super::{
    ExecOutput, ExecRequest, InstanceHandle, InstanceState, ManagedInstance, RuntimeAdapter,
};
use crate::config::{ContainerSettings, DEFAULT_NAME_PREFIX};

/// Extra seconds granted to the in-container `timeout` wrapper so the host
/// side deadline always fires first.
const INNER_TIMEOUT_SLACK_SECS: u64 = 1;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    Docker,
    /// Podman runtime (default for Linux)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Container runtime client for sandbox instances.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
    /// Image, network and filesystem settings.
    settings: ContainerSettings,
    /// Prefix of managed container names.
    name_prefix: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Podman, falls back to Docker.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else {
            // Fall back to podman, will fail at runtime
            RuntimeType::Podman
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
            settings: ContainerSettings::default(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            settings: ContainerSettings::default(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }

    /// Apply image/network/filesystem settings.
    pub fn with_settings(mut self, settings: ContainerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the prefix used to recognise managed container names.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a runtime CLI command and return its output on success.
    async fn run_cli(&self, command: &str, args: &[String]) -> RuntimeResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Build the `create` argument list for a spec.
    pub(crate) fn create_args(&self, spec: &InstanceSpec) -> Vec<String> {
        let limits = &spec.limits;
        let mut args: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.name.clone(),
        ];

        for (key, value) in spec.all_labels() {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("--cpus".to_string());
        args.push(format!("{}", limits.cpu_cores));
        args.push("--memory".to_string());
        args.push(format!("{}m", limits.memory_mb));
        // Same value as --memory disables swap.
        args.push("--memory-swap".to_string());
        args.push(format!("{}m", limits.memory_mb));
        args.push("--pids-limit".to_string());
        args.push(limits.pids_limit.to_string());

        args.push("--network".to_string());
        args.push(self.settings.network_mode.clone());

        args.push("--read-only".to_string());
        args.push("--tmpfs".to_string());
        args.push(format!(
            "{}:rw,exec,size={}m,mode=1777",
            self.settings.workdir, limits.disk_mb
        ));
        args.push("--tmpfs".to_string());
        args.push("/tmp:rw,size=64m,mode=1777".to_string());
        args.push("-w".to_string());
        args.push(self.settings.workdir.clone());

        if self.settings.enforce_disk_quota {
            args.push("--storage-opt".to_string());
            args.push(format!("size={}m", limits.disk_mb));
        }

        args.push("--security-opt".to_string());
        args.push("no-new-privileges".to_string());
        args.push("--cap-drop".to_string());
        args.push("ALL".to_string());

        args.push(self.settings.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }

    fn session_id_from_name(&self, name: &str) -> Option<String> {
        let name = name.trim_start_matches('/');
        name.strip_prefix(&format!("{}-", self.name_prefix))
            .map(|suffix| format!("vm_{}", suffix))
    }
}

#[async_trait]
impl RuntimeAdapter for ContainerRuntime {
    async fn create(&self, spec: &InstanceSpec) -> RuntimeResult<InstanceHandle> {
        spec.validate()?;

        let args = self.create_args(spec);
        let output = self.run_cli("create", &args).await.map_err(|e| match e {
            RuntimeError::CommandFailed { message, .. }
                if message.to_lowercase().contains("image not known")
                    || message.to_lowercase().contains("unable to find image")
                    || message.to_lowercase().contains("pull access denied") =>
            {
                RuntimeError::ImageNotFound(self.settings.image.clone())
            }
            other => other,
        })?;

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // Podman may print pull progress before the id.
        let id = id.lines().last().unwrap_or_default().trim().to_string();
        validate_handle(&id).map_err(|_| {
            RuntimeError::ParseError(format!("unexpected container id '{}'", id))
        })?;

        Ok(InstanceHandle::new(id))
    }

    async fn start(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        validate_handle(handle.as_str())?;
        self.run_cli("start", &["start".to_string(), handle.to_string()])
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &InstanceHandle,
        request: &ExecRequest,
    ) -> RuntimeResult<ExecOutput> {
        validate_handle(handle.as_str())?;

        // The host-side timeout kills the exec client; the in-container
        // `timeout` makes sure the command itself does not survive it.
        let inner_secs = request.timeout.as_secs() + INNER_TIMEOUT_SLACK_SECS;
        let mut command = Command::new(&self.binary);
        command.args([
            "exec",
            handle.as_str(),
            "timeout",
            "-s",
            "KILL",
            &inner_secs.to_string(),
            "sh",
            "-c",
            &request.command,
        ]);

        let output = run_bounded(command, request.timeout, request.max_output_bytes, false).await?;

        // 125/126/127 from the exec client itself mean the exec never ran.
        if !output.timed_out && output.exit_code == Some(125) {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let lower = stderr.to_lowercase();
            if lower.contains("no such container") {
                return Err(RuntimeError::NotFound(handle.to_string()));
            }
            if lower.contains("not running") || lower.contains("is not running") {
                return Err(RuntimeError::NotRunning(handle.to_string()));
            }
            if !stderr.is_empty() {
                return Err(RuntimeError::CommandFailed {
                    command: "exec".to_string(),
                    message: stderr,
                });
            }
        }

        Ok(output)
    }

    async fn stop(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        validate_handle(handle.as_str())?;
        self.run_cli(
            "stop",
            &[
                "stop".to_string(),
                "-t".to_string(),
                self.settings.stop_timeout_seconds.to_string(),
                handle.to_string(),
            ],
        )
        .await
        .map_err(|e| {
            if e.is_not_found() {
                RuntimeError::NotFound(handle.to_string())
            } else {
                e
            }
        })?;
        Ok(())
    }

    async fn destroy(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        validate_handle(handle.as_str())?;
        self.run_cli(
            "rm",
            &["rm".to_string(), "-f".to_string(), "-v".to_string(), handle.to_string()],
        )
        .await
        .map_err(|e| {
            if e.is_not_found() {
                RuntimeError::NotFound(handle.to_string())
            } else {
                e
            }
        })?;
        Ok(())
    }

    async fn inspect(&self, handle: &InstanceHandle) -> RuntimeResult<InstanceState> {
        validate_handle(handle.as_str())?;

        let result = self
            .run_cli(
                "inspect",
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.Status}}".to_string(),
                    handle.to_string(),
                ],
            )
            .await;

        match result {
            Ok(output) => {
                let status = String::from_utf8_lossy(&output.stdout)
                    .trim()
                    .trim_matches('"')
                    .to_string();
                if status.is_empty() {
                    return Ok(InstanceState::Missing);
                }
                Ok(InstanceState::from_status(&status))
            }
            Err(e) if e.is_not_found() => Ok(InstanceState::Missing),
            Err(e) => Err(e),
        }
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedInstance>> {
        let output = self
            .run_cli(
                "ps",
                &[
                    "ps".to_string(),
                    "-a".to_string(),
                    "--no-trunc".to_string(),
                    "--filter".to_string(),
                    format!("label={}=true", MANAGED_LABEL),
                    "--format".to_string(),
                    "{{.ID}}\t{{.Names}}\t{{.State}}".to_string(),
                ],
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ps_lines(&stdout)
            .into_iter()
            .map(|(id, name, state)| ManagedInstance {
                handle: InstanceHandle::new(id),
                session_id: self.session_id_from_name(&name),
                state: InstanceState::from_status(&state),
            })
            .collect())
    }

    async fn health_check(&self) -> RuntimeResult<String> {
        let output = self
            .run_cli(
                "version",
                &["version".to_string(), "--format".to_string(), "json".to_string()],
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Parse `ID<TAB>NAMES<TAB>STATE` lines from `ps --format`.
fn parse_ps_lines(stdout: &str) -> Vec<(String, String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().split('\t');
            let id = parts.next()?.trim();
            if id.is_empty() {
                return None;
            }
            let names = parts.next().unwrap_or_default().trim();
            // Docker joins multiple names with commas.
            let name = names.split(',').next().unwrap_or_default().to_string();
            let state = parts.next().unwrap_or("unknown").trim().to_string();
            Some((id.to_string(), name, state))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;

    fn runtime() -> ContainerRuntime {
        ContainerRuntime::with_type(RuntimeType::Docker).with_settings(ContainerSettings {
            image: "alpine:3.20".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_create_args_apply_limits_and_labels() {
        let limits = ResourceLimits {
            cpu_cores: 1.5,
            memory_mb: 512,
            disk_mb: 100,
            pids_limit: 64,
            ..Default::default()
        };
        let spec = InstanceSpec::for_session("sandboxvm", "vm_abc123", limits);
        let args = runtime().create_args(&spec);
        let joined = args.join(" ");

        assert_eq!(args[0], "create");
        assert!(joined.contains("--name sandboxvm-abc123"));
        assert!(joined.contains("--label sandboxvm.managed=true"));
        assert!(joined.contains("--label sandboxvm.session=vm_abc123"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--pids-limit 64"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("size=100m"));
        assert!(!joined.contains("--storage-opt"));
        assert!(joined.ends_with("alpine:3.20 sleep infinity"));
    }

    #[test]
    fn test_create_args_storage_quota_opt_in() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Podman).with_settings(
            ContainerSettings {
                enforce_disk_quota: true,
                ..Default::default()
            },
        );
        let spec = InstanceSpec::for_session("sandboxvm", "vm_1", ResourceLimits::default());
        let joined = runtime.create_args(&spec).join(" ");
        assert!(joined.contains("--storage-opt size=512m"));
    }

    #[test]
    fn test_parse_ps_lines() {
        let out = "abc123\tsandboxvm-0011\trunning\n\ndef456\t/sandboxvm-0022,alias\texited\n";
        let parsed = parse_ps_lines(out);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("abc123".into(), "sandboxvm-0011".into(), "running".into()));
        assert_eq!(parsed[1].1, "/sandboxvm-0022");
        assert_eq!(parsed[1].2, "exited");
    }

    #[test]
    fn test_session_id_from_name() {
        let rt = runtime();
        assert_eq!(rt.session_id_from_name("/sandboxvm-0011"), Some("vm_0011".to_string()));
        assert_eq!(rt.session_id_from_name("other-0011"), None);
    }

    #[test]
    fn test_runtime_type_binary() {
        assert_eq!(RuntimeType::Docker.default_binary(), "docker");
        assert_eq!(RuntimeType::Podman.to_string(), "podman");
    }

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful when docker or podman is installed.
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }
}
