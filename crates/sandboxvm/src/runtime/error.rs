//! Runtime adapter error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for runtime adapter operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Whether a failed runtime call may succeed if retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Daemon hiccup, timeout, I/O blip. Safe to retry a bounded number of times.
    Transient,
    /// Invalid configuration, missing image, unknown instance. Never retried.
    Permanent,
}

/// Errors that can occur during runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime command failed.
    #[error("runtime {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Instance was not found.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Instance exists but is not running.
    #[error("instance not running: {0}")]
    NotRunning(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse runtime output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The call did not complete in time.
    #[error("runtime {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Substrings in CLI stderr that point at a momentarily unreachable daemon.
const TRANSIENT_MARKERS: &[&str] = &[
    "cannot connect",
    "connection refused",
    "connection reset",
    "is the docker daemon running",
    "daemon is not running",
    "timeout",
    "timed out",
    "temporarily unavailable",
    "resource temporarily",
    "try again",
    "too many requests",
    "i/o timeout",
];

/// Substrings in CLI stderr that identify a missing instance.
const NOT_FOUND_MARKERS: &[&str] = &["no such container", "no such object", "no container with"];

impl RuntimeError {
    /// Classify the failure for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::Timeout { .. } => ErrorClass::Transient,
            RuntimeError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            RuntimeError::Io(err) => match err.kind() {
                // Missing binary or forbidden socket will not fix itself.
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorClass::Permanent
                }
                _ => ErrorClass::Transient,
            },
            RuntimeError::NotFound(_)
            | RuntimeError::NotRunning(_)
            | RuntimeError::ImageNotFound(_)
            | RuntimeError::ParseError(_)
            | RuntimeError::InvalidInput(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// True when the instance is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::NotFound(_) => true,
            RuntimeError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(message: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: "create".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_daemon_unreachable_is_transient() {
        let err = failed(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_bad_image_is_permanent() {
        let err = failed("Error: short-name \"nope\" did not resolve to an alias");
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(
            RuntimeError::ImageNotFound("nope".to_string()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = RuntimeError::Timeout {
            operation: "start".to_string(),
            after: Duration::from_secs(30),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_missing_binary_is_permanent() {
        let err = RuntimeError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.class(), ErrorClass::Permanent);
        let err = RuntimeError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(failed("Error: No such container: abc123").is_not_found());
        assert!(RuntimeError::NotFound("x".to_string()).is_not_found());
        assert!(!failed("permission denied").is_not_found());
    }
}
