//! Capability interfaces to the systems that physically host sandboxes.
//!
//! The manager only talks to a [`SandboxBackend`] (create/query/exec/destroy)
//! and a [`GitBackend`] (clone/sync). Concrete backends are swappable:
//! [`LocalBackend`] runs sandboxes as local directories, [`ExecGitBackend`]
//! drives git through the sandbox's own exec, and the [`fake`] module
//! provides scripted backends for tests.

pub mod fake;
mod git_exec;
mod local;

pub use git_exec::ExecGitBackend;
pub use local::LocalBackend;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, SyncError};
use crate::types::{GitSyncStatus, GitUser, SandboxId, SandboxPhase, SessionConfig};

/// Opaque reference to a sandbox as known by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRef(String);

impl BackendRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a sandbox as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    /// Still booting.
    Starting,
    /// Live and accepting commands.
    Running,
    /// Exited cleanly.
    Exited,
    /// Died with an unrecoverable error.
    Failed(String),
}

impl BackendState {
    /// The lifecycle phase this backend state corresponds to.
    pub fn phase(&self) -> SandboxPhase {
        match self {
            BackendState::Starting => SandboxPhase::Provisioning,
            BackendState::Running => SandboxPhase::Running,
            BackendState::Exited => SandboxPhase::Stopped,
            BackendState::Failed(_) => SandboxPhase::Failed,
        }
    }
}

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout without the trailing newline.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches(['\n', '\r'])
    }
}

/// Whether a backend error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The backend could not be reached; retrying may help.
    Transient,
    /// The backend rejected the request or lost the sandbox.
    Fatal,
}

/// Error reported by a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err.kind {
            BackendErrorKind::Transient => Error::BackendUnavailable(err.message),
            BackendErrorKind::Fatal => Error::Backend(err.message),
        }
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Provisioning backend: creates, inspects, drives and destroys sandboxes.
///
/// All methods may block on remote I/O.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Creates a sandbox for `config`, returning its reference and the
    /// state it is in once the call returns.
    async fn create(
        &self,
        id: &SandboxId,
        config: &SessionConfig,
    ) -> BackendResult<(BackendRef, BackendState)>;

    /// Queries the authoritative state of a sandbox.
    async fn query(&self, sandbox: &BackendRef) -> BackendResult<BackendState>;

    /// Runs a shell command inside a sandbox.
    async fn exec(&self, sandbox: &BackendRef, command: &str) -> BackendResult<ExecOutput> {
        self.exec_with_env(sandbox, command, &BTreeMap::new()).await
    }

    /// Runs a shell command with extra environment variables on top of the
    /// session's. Secrets are passed here, never inside `command`, and
    /// implementations must not log the values.
    async fn exec_with_env(
        &self,
        sandbox: &BackendRef,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> BackendResult<ExecOutput>;

    /// Destroys a sandbox and releases its resources.
    async fn destroy(&self, sandbox: &BackendRef) -> BackendResult<()>;

    /// Returns the name of this backend.
    fn name(&self) -> &str;
}

/// Git backend: maintains the working tree inside a sandbox.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Clones `url` at `git_ref` into the sandbox, returning the checked-out commit.
    async fn clone_repo(
        &self,
        sandbox: &BackendRef,
        url: &str,
        git_ref: &str,
        user: &GitUser,
    ) -> std::result::Result<String, SyncError>;

    /// Brings an existing working tree up to date with `git_ref`.
    async fn sync(
        &self,
        sandbox: &BackendRef,
        git_ref: &str,
        existing: &GitSyncStatus,
        user: &GitUser,
    ) -> std::result::Result<String, SyncError>;
}
