//! Command execution gateway.
//!
//! Wraps `RuntimeAdapter::exec` with the session's limits, an outer deadline
//! and lossy UTF-8 decoding.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::error::{SessionError, SessionResult};
use crate::limits::ResourceLimits;
use crate::runtime::{ExecOutput, ExecRequest, InstanceHandle, RuntimeAdapter};

/// Exit code reported for a command killed by the timeout (matches `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Time the adapter gets beyond the execution timeout to hand back a result.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Exit code used when the process died without reporting one.
const UNKNOWN_EXIT_CODE: i32 = 137;

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Output was cut at the limit or the command hit its timeout.
    pub truncated: bool,
}

impl From<ExecOutput> for ExecutionResult {
    fn from(output: ExecOutput) -> Self {
        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            output.exit_code.unwrap_or(UNKNOWN_EXIT_CODE)
        };
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
            truncated: output.truncated || output.timed_out,
        }
    }
}

/// Reject commands that are empty or longer than the session allows.
pub fn validate_command(command: &str, limits: &ResourceLimits) -> SessionResult<()> {
    if command.trim().is_empty() {
        return Err(SessionError::BadRequest("command cannot be empty".to_string()));
    }
    if command.len() > limits.max_command_bytes {
        return Err(SessionError::BadRequest(format!(
            "command exceeds {} bytes",
            limits.max_command_bytes
        )));
    }
    if command.contains('\0') {
        return Err(SessionError::BadRequest(
            "command cannot contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ExecutionGateway {
    runtime: Arc<dyn RuntimeAdapter>,
    grace: Duration,
}

impl ExecutionGateway {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            runtime,
            grace: DEFAULT_GRACE,
        }
    }

    /// Override the grace period on top of the execution timeout.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run `command` in the instance. The caller holds the session's
    /// execution lock.
    pub async fn run(
        &self,
        handle: &InstanceHandle,
        command: &str,
        limits: &ResourceLimits,
    ) -> SessionResult<ExecutionResult> {
        validate_command(command, limits)?;

        let request = ExecRequest {
            command: command.to_string(),
            timeout: limits.exec_timeout(),
            max_output_bytes: limits.max_output_bytes,
        };
        let deadline = request.timeout + self.grace;

        let output = match tokio::time::timeout(deadline, self.runtime.exec(handle, &request)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(handle = %handle, "exec failed: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                warn!(handle = %handle, "exec did not return within {:?}", deadline);
                return Err(SessionError::ExecutionTimeout(deadline));
            }
        };

        if output.timed_out {
            debug!(handle = %handle, "command killed after {:?}", request.timeout);
        }
        Ok(output.into())
    }
}
