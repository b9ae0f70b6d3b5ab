//! Host process backend.
//!
//! Each instance is a directory under the base dir holding an `instance.json`
//! marker and a `work/` directory. Commands run with `sh -c` inside `work/`
//! with a scrubbed environment, in their own process group.
//!
//! There is no CPU, memory or network isolation here. Use it for development
//! and tests only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::error::{RuntimeError, RuntimeResult};
use super::output::run_bounded;
use super::spec::{InstanceSpec, MANAGED_LABEL, SESSION_LABEL, validate_handle};
use super::{
    ExecOutput, ExecRequest, InstanceHandle, InstanceState, ManagedInstance, RuntimeAdapter,
};

const MARKER_FILE: &str = "instance.json";
const WORK_DIR: &str = "work";
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MarkerState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceMarker {
    name: String,
    session_id: String,
    labels: BTreeMap<String, String>,
    state: MarkerState,
    created_at: DateTime<Utc>,
}

/// Sandbox backend built from host processes and scratch directories.
#[derive(Debug, Clone)]
pub struct LocalRuntime {
    base_dir: PathBuf,
}

impl LocalRuntime {
    /// Create the backend, making sure the base directory exists.
    pub fn new(base_dir: impl AsRef<Path>) -> RuntimeResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        info!("Local runtime rooted at {:?}", base_dir);
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn instance_dir(&self, handle: &InstanceHandle) -> RuntimeResult<PathBuf> {
        validate_handle(handle.as_str())?;
        Ok(self.base_dir.join(handle.as_str()))
    }

    async fn read_marker(&self, dir: &Path) -> RuntimeResult<Option<InstanceMarker>> {
        match tokio::fs::read(dir.join(MARKER_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RuntimeError::ParseError(format!("{}: {}", dir.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_marker(&self, dir: &Path, marker: &InstanceMarker) -> RuntimeResult<()> {
        let bytes = serde_json::to_vec_pretty(marker)
            .map_err(|e| RuntimeError::ParseError(e.to_string()))?;
        let tmp = dir.join(format!("{}.tmp", MARKER_FILE));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, dir.join(MARKER_FILE)).await?;
        Ok(())
    }

    async fn load(&self, handle: &InstanceHandle) -> RuntimeResult<(PathBuf, InstanceMarker)> {
        let dir = self.instance_dir(handle)?;
        match self.read_marker(&dir).await? {
            Some(marker) => Ok((dir, marker)),
            None => Err(RuntimeError::NotFound(handle.to_string())),
        }
    }

    async fn set_state(&self, handle: &InstanceHandle, state: MarkerState) -> RuntimeResult<()> {
        let (dir, mut marker) = self.load(handle).await?;
        marker.state = state;
        self.write_marker(&dir, &marker).await
    }
}

fn marker_state(state: MarkerState) -> InstanceState {
    match state {
        MarkerState::Created => InstanceState::Created,
        MarkerState::Running => InstanceState::Running,
        MarkerState::Stopped => InstanceState::Stopped,
    }
}

#[async_trait]
impl RuntimeAdapter for LocalRuntime {
    async fn create(&self, spec: &InstanceSpec) -> RuntimeResult<InstanceHandle> {
        spec.validate()?;

        let handle = InstanceHandle::new(spec.name.clone());
        let dir = self.instance_dir(&handle)?;
        if tokio::fs::try_exists(&dir).await? {
            return Err(RuntimeError::CommandFailed {
                command: "create".to_string(),
                message: format!("instance {} already exists", spec.name),
            });
        }

        tokio::fs::create_dir_all(dir.join(WORK_DIR)).await?;
        let marker = InstanceMarker {
            name: spec.name.clone(),
            session_id: spec.session_id.clone(),
            labels: spec.all_labels(),
            state: MarkerState::Created,
            created_at: Utc::now(),
        };
        self.write_marker(&dir, &marker).await?;

        debug!("Created local instance {}", spec.name);
        Ok(handle)
    }

    async fn start(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.set_state(handle, MarkerState::Running).await
    }

    async fn exec(
        &self,
        handle: &InstanceHandle,
        request: &ExecRequest,
    ) -> RuntimeResult<ExecOutput> {
        let (dir, marker) = self.load(handle).await?;
        if marker.state != MarkerState::Running {
            return Err(RuntimeError::NotRunning(handle.to_string()));
        }

        let work = dir.join(WORK_DIR);
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&work)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &work)
            .env("TMPDIR", &work);

        run_bounded(command, request.timeout, request.max_output_bytes, true).await
    }

    async fn stop(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.set_state(handle, MarkerState::Stopped).await
    }

    async fn destroy(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        let dir = self.instance_dir(handle)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed local instance {}", handle);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RuntimeError::NotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, handle: &InstanceHandle) -> RuntimeResult<InstanceState> {
        let dir = self.instance_dir(handle)?;
        Ok(match self.read_marker(&dir).await? {
            Some(marker) => marker_state(marker.state),
            None => InstanceState::Missing,
        })
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedInstance>> {
        let mut instances = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let marker = match self.read_marker(&entry.path()).await {
                Ok(Some(marker)) => marker,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Skipping unreadable instance {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            if marker.labels.get(MANAGED_LABEL).map(String::as_str) != Some("true") {
                continue;
            }
            instances.push(ManagedInstance {
                handle: InstanceHandle::new(entry.file_name().to_string_lossy().to_string()),
                session_id: marker.labels.get(SESSION_LABEL).cloned(),
                state: marker_state(marker.state),
            });
        }

        Ok(instances)
    }

    async fn health_check(&self) -> RuntimeResult<String> {
        let metadata = tokio::fs::metadata(&self.base_dir).await?;
        if !metadata.is_dir() {
            return Err(RuntimeError::InvalidInput(format!(
                "{} is not a directory",
                self.base_dir.display()
            )));
        }
        Ok(format!("local runtime at {}", self.base_dir.display()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::limits::ResourceLimits;

    fn request(command: &str, timeout: Duration) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            timeout,
            max_output_bytes: 4096,
        }
    }

    async fn running(runtime: &LocalRuntime, session: &str) -> InstanceHandle {
        let spec = InstanceSpec::for_session("sandboxvm", session, ResourceLimits::default());
        let handle = runtime.create(&spec).await.unwrap();
        runtime.start(&handle).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_lifecycle_and_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path()).unwrap();
        let handle = running(&runtime, "vm_aa01").await;

        assert_eq!(runtime.inspect(&handle).await.unwrap(), InstanceState::Running);

        let out = runtime
            .exec(&handle, &request("echo hi > f && cat f && pwd", Duration::from_secs(5)))
            .await
            .unwrap();
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.starts_with("hi\n"));
        assert!(stdout.trim_end().ends_with("work"));
        assert_eq!(out.exit_code, Some(0));

        runtime.stop(&handle).await.unwrap();
        assert!(matches!(
            runtime.exec(&handle, &request("true", Duration::from_secs(5))).await,
            Err(RuntimeError::NotRunning(_))
        ));

        runtime.destroy(&handle).await.unwrap();
        assert_eq!(runtime.inspect(&handle).await.unwrap(), InstanceState::Missing);
        assert!(runtime.destroy(&handle).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path()).unwrap();
        let handle = running(&runtime, "vm_aa02").await;

        let started = std::time::Instant::now();
        let out = runtime
            .exec(&handle, &request("sleep 30 & sleep 30", Duration::from_millis(300)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path()).unwrap();
        let handle = running(&runtime, "vm_aa03").await;

        let out = runtime
            .exec(&handle, &request("env", Duration::from_secs(5)))
            .await
            .unwrap();
        let env = String::from_utf8_lossy(&out.stdout);
        assert!(env.contains("PATH=/usr/local/bin:/usr/bin:/bin"));
        assert!(!env.contains("CARGO"));
    }

    #[tokio::test]
    async fn test_list_managed_reads_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path()).unwrap();
        let handle = running(&runtime, "vm_aa04").await;
        std::fs::create_dir(tmp.path().join("unrelated")).unwrap();

        let listed = runtime.list_managed().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].handle, handle);
        assert_eq!(listed[0].session_id.as_deref(), Some("vm_aa04"));
        assert_eq!(listed[0].state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_rejects_traversal_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(tmp.path()).unwrap();
        let err = runtime
            .destroy(&InstanceHandle::new("../etc"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidInput(_)));
    }
}
