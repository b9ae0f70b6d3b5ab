//! Session layer errors.

use std::time::Duration;

use thiserror::Error;

use super::quota::RejectReason;
use crate::runtime::{ErrorClass, RuntimeError};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Admission refused; carries the limit that was hit.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(RejectReason),

    /// Unknown id, or an id owned by someone else.
    #[error("session not found")]
    NotFound,

    /// The session already ended.
    #[error("session {0} has ended")]
    Gone(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller already owns a live session and reuse is disabled.
    #[error("identity already has an active session: {0}")]
    AlreadyActive(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The runtime failed in a way that may clear up on its own.
    #[error("runtime unavailable: {0}")]
    RuntimeTransient(String),

    #[error("runtime failed: {0}")]
    RuntimeFailed(String),

    /// The runtime did not return an execution result in time.
    #[error("execution did not finish within {0:?}")]
    ExecutionTimeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RuntimeError> for SessionError {
    fn from(err: RuntimeError) -> Self {
        match err.class() {
            ErrorClass::Transient => SessionError::RuntimeTransient(err.to_string()),
            ErrorClass::Permanent => SessionError::RuntimeFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_are_classified() {
        let err: SessionError = RuntimeError::Timeout {
            operation: "create".to_string(),
            after: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(err, SessionError::RuntimeTransient(_)));

        let err: SessionError = RuntimeError::ImageNotFound("nope".to_string()).into();
        assert!(matches!(err, SessionError::RuntimeFailed(ref m) if m.contains("nope")));
    }
}
