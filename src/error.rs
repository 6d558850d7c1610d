//! Error types for the sandbox lifecycle subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{SandboxId, SandboxPhase};

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The session or manager configuration was rejected. Never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another provisioning attempt for the same key is still running.
    #[error("provisioning already in progress for {key}")]
    ProvisionInProgress { key: String },

    /// The backend could not be reached. Callers may retry with backoff.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend reported an unrecoverable error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Provisioning did not produce a running sandbox.
    #[error("failed to provision sandbox {id}: {reason}")]
    ProvisionFailed { id: SandboxId, reason: String },

    /// The sandbox exists but is not in the `Running` phase.
    #[error("sandbox {id} is not running (phase: {phase})")]
    SandboxNotRunning { id: SandboxId, phase: SandboxPhase },

    /// No sandbox with this id is registered.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(SandboxId),

    /// The backend failed to run a command. Not retried automatically.
    #[error("exec failed in sandbox {id}: {diagnostics}")]
    ExecFailed { id: SandboxId, diagnostics: String },

    /// Git synchronization failed.
    #[error("git sync failed: {0}")]
    Sync(#[from] SyncError),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The operation exceeded its configured deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The manager no longer accepts new work.
    #[error("sandbox manager is shutting down")]
    ShuttingDown,

    /// Shutdown finished, but some sandboxes failed to tear down cleanly.
    #[error("shutdown completed with {} teardown failure(s)", .0.len())]
    Shutdown(Vec<(SandboxId, Error)>),

    /// IO error while talking to a local backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cause of a failed git sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Credentials were missing or rejected.
    Auth,
    /// Local changes or history prevented a fast-forward.
    Conflict,
    /// The remote could not be reached.
    Network,
    /// The sandbox stopped while the sync was in flight.
    Cancelled,
    /// Anything else the git backend reported.
    Other,
}

/// Structured git sync failure, recorded in `GitSyncStatus` and events.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_error_reports_failure_count() {
        let err = Error::Shutdown(vec![
            (SandboxId::from("a"), Error::Backend("boom".into())),
            (SandboxId::from("b"), Error::BackendUnavailable("down".into())),
        ]);
        assert_eq!(
            err.to_string(),
            "shutdown completed with 2 teardown failure(s)"
        );
    }

    #[test]
    fn sync_error_kind_serializes_to_snake_case() {
        let json = serde_json::to_string(&SyncErrorKind::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn sync_error_converts_into_error() {
        let err: Error = SyncError::new(SyncErrorKind::Auth, "bad token").into();
        assert!(matches!(err, Error::Sync(ref e) if e.kind == SyncErrorKind::Auth));
    }
}
