//! Bounded capture of child process output.
//!
//! Both backends run commands as host child processes (`sh -c` directly, or
//! `docker exec`), so the timeout and output caps live here.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::error::{RuntimeError, RuntimeResult};
use super::ExecOutput;

/// How long to wait for pipes to close after the process exited or was killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read a stream to EOF, keeping at most `limit` bytes.
///
/// Bytes past the limit are read and dropped so the writer never blocks on a
/// full pipe.
pub(crate) async fn capture_bounded<R>(mut reader: R, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::with_capacity(limit.min(8192));
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.len());
                if n > room {
                    captured.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    captured.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) => {
                debug!("output stream closed with error: {:?}", e);
                break;
            }
        }
    }

    (captured, truncated)
}

/// Spawn `command`, wait up to `timeout`, and capture both streams.
///
/// When `own_group` is set the child is placed in its own process group and
/// the whole group is killed on timeout.
pub(crate) async fn run_bounded(
    mut command: Command,
    timeout: Duration,
    max_output_bytes: usize,
    own_group: bool,
) -> RuntimeResult<ExecOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    if own_group {
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|e| RuntimeError::CommandFailed {
        command: "exec".to_string(),
        message: e.to_string(),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RuntimeError::Io(std::io::Error::other("stdout was not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RuntimeError::Io(std::io::Error::other("stderr was not captured")))?;

    let stdout_task = tokio::spawn(capture_bounded(stdout, max_output_bytes));
    let stderr_task = tokio::spawn(capture_bounded(stderr, max_output_bytes));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (exit_code_of(status), false),
        Ok(Err(e)) => {
            kill_child(&mut child, own_group).await;
            return Err(RuntimeError::Io(e));
        }
        Err(_) => {
            debug!("command exceeded {:?}, killing", timeout);
            kill_child(&mut child, own_group).await;
            (None, true)
        }
    };

    let (stdout, stdout_truncated) = join_capture(stdout_task).await;
    let (stderr, stderr_truncated) = join_capture(stderr_task).await;

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
        truncated: stdout_truncated || stderr_truncated,
    })
}

async fn join_capture(
    mut task: tokio::task::JoinHandle<(Vec<u8>, bool)>,
) -> (Vec<u8>, bool) {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("output capture task failed: {:?}", e);
            (Vec::new(), true)
        }
        Err(_) => {
            // A descendant outlived the kill and still holds the pipe open.
            task.abort();
            (Vec::new(), true)
        }
    }
}

async fn kill_child(child: &mut Child, own_group: bool) {
    #[cfg(unix)]
    if own_group {
        if let Some(pid) = child.id() {
            // SAFETY: killpg only sends a signal; the pid belongs to our child,
            // which leads its own process group.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("kill after timeout failed (process may have exited): {:?}", e);
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_bounded_truncates() {
        let data = vec![b'x'; 20_000];
        let (captured, truncated) = capture_bounded(&data[..], 100).await;
        assert_eq!(captured.len(), 100);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_capture_bounded_exact_fit() {
        let data = b"hello\n".to_vec();
        let (captured, truncated) = capture_bounded(&data[..], 6).await;
        assert_eq!(captured, b"hello\n");
        assert!(!truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_bounded_reports_exit_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "printf out; printf err >&2; exit 3"]);

        let output = run_bounded(command, Duration::from_secs(5), 1024, true)
            .await
            .unwrap();
        assert_eq!(output.stdout, b"out");
        assert_eq!(output.stderr, b"err");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
        assert!(!output.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_bounded_kills_on_timeout() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo started; sleep 30"]);

        let started = std::time::Instant::now();
        let output = run_bounded(command, Duration::from_millis(300), 1024, true)
            .await
            .unwrap();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
