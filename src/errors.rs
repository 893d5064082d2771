use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for a rotation run.
///
/// The variant decides the handling policy: transient failures are retried
/// locally with backoff, validation failures trigger rollback, everything
/// else aborts the run. The binary maps the final error to an exit code.
#[derive(Debug, Error)]
pub enum RotateError {
    #[error("secret store unavailable: {0}")]
    SecretUnavailable(String),

    #[error("secret version conflict: {0}")]
    Conflict(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("deployment did not stabilize within {0:?}")]
    DeploymentTimeout(Duration),

    #[error("post-refresh validation failed: {0}")]
    ValidationFailed(String),

    #[error("admin credentials unrecoverable: {0}")]
    AdminCredentialsLost(String),

    #[error("config file corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("{0}")]
    Usage(String),
}

impl RotateError {
    /// Transient errors are the only ones the backoff loop re-attempts.
    pub fn is_transient(&self) -> bool {
        matches!(self, RotateError::TransientIo(_))
    }

    /// Exit code contract: 0 success, 1 fatal, 2 usage.
    pub fn exit_code(&self) -> u8 {
        match self {
            RotateError::Usage(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for RotateError {
    fn from(e: std::io::Error) -> Self {
        RotateError::TransientIo(format!("filesystem: {e}"))
    }
}

impl From<serde_json::Error> for RotateError {
    fn from(e: serde_json::Error) -> Self {
        RotateError::SecretUnavailable(format!("secret document malformed: {e}"))
    }
}
