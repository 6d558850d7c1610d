//! Directory-based backend that runs sandboxes on the local machine.
//!
//! Each sandbox is a fresh directory; commands run through `sh -c` with the
//! session's environment. There is no isolation beyond the working
//! directory, so this backend is meant for development and tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;

use crate::types::{SandboxId, SessionConfig};

use super::{BackendError, BackendRef, BackendResult, BackendState, ExecOutput, SandboxBackend};

/// One sandbox directory.
#[derive(Debug, Clone)]
struct LocalSandbox {
    path: PathBuf,
    env: BTreeMap<String, String>,
}

/// Backend that creates sandboxes as local directories.
#[derive(Clone)]
pub struct LocalBackend {
    /// Base directory for sandboxes. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
    /// Counter for generating unique directory names (shared across clones).
    counter: Arc<AtomicU64>,
    sandboxes: Arc<Mutex<HashMap<BackendRef, LocalSandbox>>>,
}

impl LocalBackend {
    /// Creates a new local backend.
    ///
    /// If `base_dir` is provided, sandboxes are created there.
    /// Otherwise, a system temp directory is used.
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            counter: Arc::new(AtomicU64::new(0)),
            sandboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sandbox_path(&self, id: &SandboxId) -> PathBuf {
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("inspect-sandboxes"),
        };
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        base.join(format!("sandbox-{}-{}", id, n))
    }

    fn lookup(&self, sandbox: &BackendRef) -> BackendResult<LocalSandbox> {
        self.sandboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(sandbox)
            .cloned()
            .ok_or_else(|| BackendError::fatal(format!("unknown sandbox {}", sandbox)))
    }

    /// Returns the working directory of a sandbox, if it exists.
    pub fn path_of(&self, sandbox: &BackendRef) -> Option<PathBuf> {
        self.lookup(sandbox).ok().map(|s| s.path)
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    async fn create(
        &self,
        id: &SandboxId,
        config: &SessionConfig,
    ) -> BackendResult<(BackendRef, BackendState)> {
        let path = self.sandbox_path(id);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            BackendError::fatal(format!("failed to create {}: {}", path.display(), e))
        })?;

        let backend_ref = BackendRef::new(path.to_string_lossy());
        tracing::info!(
            sandbox_id = %id,
            path = ?path,
            cpu_cores = config.limits().cpu_cores,
            memory_mb = config.limits().memory_mb,
            "created local sandbox (resource limits are not enforced)"
        );

        self.sandboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                backend_ref.clone(),
                LocalSandbox {
                    path,
                    env: config.env().clone(),
                },
            );

        Ok((backend_ref, BackendState::Running))
    }

    async fn query(&self, sandbox: &BackendRef) -> BackendResult<BackendState> {
        let local = self.lookup(sandbox)?;
        match tokio::fs::metadata(&local.path).await {
            Ok(meta) if meta.is_dir() => Ok(BackendState::Running),
            Ok(_) => Ok(BackendState::Failed(format!(
                "{} is no longer a directory",
                local.path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackendState::Exited),
            Err(e) => Err(BackendError::transient(format!(
                "failed to stat {}: {}",
                local.path.display(),
                e
            ))),
        }
    }

    async fn exec_with_env(
        &self,
        sandbox: &BackendRef,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> BackendResult<ExecOutput> {
        let local = self.lookup(sandbox)?;

        tracing::debug!(
            sandbox = %sandbox,
            command = %command,
            extra_env = ?env.keys().collect::<Vec<_>>(),
            "exec in local sandbox"
        );

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&local.path)
            .envs(&local.env)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::fatal(format!("failed to spawn sh: {}", e)))?;

        Ok(ExecOutput {
            // Killed by a signal when there is no code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn destroy(&self, sandbox: &BackendRef) -> BackendResult<()> {
        let removed = self
            .sandboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(sandbox);

        let Some(local) = removed else {
            // Already destroyed.
            return Ok(());
        };

        match tokio::fs::remove_dir_all(&local.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackendError::fatal(format!(
                    "failed to remove {}: {}",
                    local.path.display(),
                    e
                )))
            }
        }

        tracing::info!(path = ?local.path, "destroyed local sandbox");
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}
