//! Scripted in-memory backends for tests and demos.
//!
//! Responses are queued per operation; when a queue is empty the backend
//! falls back to a sensible default (sandboxes start `Running`, `echo`
//! commands echo, git reports increasing fake commits).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{GitSyncStatus, GitUser, SandboxId, SessionConfig};

use super::{
    BackendError, BackendRef, BackendResult, BackendState, ExecOutput, GitBackend, SandboxBackend,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Programmable [`SandboxBackend`].
#[derive(Default)]
pub struct ScriptedBackend {
    create_results: Mutex<VecDeque<BackendResult<BackendState>>>,
    query_results: Mutex<VecDeque<BackendResult<BackendState>>>,
    exec_results: Mutex<VecDeque<BackendResult<ExecOutput>>>,
    destroy_results: Mutex<VecDeque<BackendResult<()>>>,
    states: Mutex<HashMap<BackendRef, BackendState>>,
    exec_log: Mutex<Vec<String>>,
    exec_env_log: Mutex<Vec<BTreeMap<String, String>>>,
    create_delay: Mutex<Option<Duration>>,
    exec_delay: Mutex<Option<Duration>>,
    create_calls: AtomicUsize,
    query_calls: AtomicUsize,
    exec_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next `create`.
    pub fn push_create(&self, result: BackendResult<BackendState>) {
        lock(&self.create_results).push_back(result);
    }

    /// Queues the outcome of the next `query`.
    pub fn push_query(&self, result: BackendResult<BackendState>) {
        lock(&self.query_results).push_back(result);
    }

    /// Queues the outcome of the next `exec`.
    pub fn push_exec(&self, result: BackendResult<ExecOutput>) {
        lock(&self.exec_results).push_back(result);
    }

    /// Queues the outcome of the next `destroy`.
    pub fn push_destroy(&self, result: BackendResult<()>) {
        lock(&self.destroy_results).push_back(result);
    }

    /// Overrides the state `query` reports for a sandbox.
    pub fn set_state(&self, sandbox: &BackendRef, state: BackendState) {
        lock(&self.states).insert(sandbox.clone(), state);
    }

    /// Makes every `create` sleep first.
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = Some(delay);
    }

    /// Makes every `exec` sleep first.
    pub fn set_exec_delay(&self, delay: Duration) {
        *lock(&self.exec_delay) = Some(delay);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// Commands received by `exec`, in order.
    pub fn exec_log(&self) -> Vec<String> {
        lock(&self.exec_log).clone()
    }

    /// Extra environment passed with each `exec`, in order.
    pub fn exec_env_log(&self) -> Vec<BTreeMap<String, String>> {
        lock(&self.exec_env_log).clone()
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn create(
        &self,
        id: &SandboxId,
        _config: &SessionConfig,
    ) -> BackendResult<(BackendRef, BackendState)> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.create_results)
            .pop_front()
            .unwrap_or(Ok(BackendState::Running))?;
        let backend_ref = BackendRef::new(format!("scripted-{}", id));
        lock(&self.states).insert(backend_ref.clone(), state.clone());
        Ok((backend_ref, state))
    }

    async fn query(&self, sandbox: &BackendRef) -> BackendResult<BackendState> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = lock(&self.query_results).pop_front() {
            return result;
        }
        lock(&self.states)
            .get(sandbox)
            .cloned()
            .ok_or_else(|| BackendError::fatal(format!("unknown sandbox {}", sandbox)))
    }

    async fn exec_with_env(
        &self,
        _sandbox: &BackendRef,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> BackendResult<ExecOutput> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.exec_log).push(command.to_string());
        lock(&self.exec_env_log).push(env.clone());
        let delay = *lock(&self.exec_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(result) = lock(&self.exec_results).pop_front() {
            return result;
        }
        let stdout = match command.strip_prefix("echo ") {
            Some(rest) => format!("{}\n", rest),
            None => String::new(),
        };
        Ok(ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn destroy(&self, sandbox: &BackendRef) -> BackendResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.destroy_results).pop_front().unwrap_or(Ok(()))?;
        lock(&self.states).insert(sandbox.clone(), BackendState::Exited);
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Programmable [`GitBackend`].
#[derive(Default)]
pub struct ScriptedGit {
    clone_results: Mutex<VecDeque<Result<String, SyncError>>>,
    sync_results: Mutex<VecDeque<Result<String, SyncError>>>,
    delay: Mutex<Option<Duration>>,
    users: Mutex<Vec<GitUser>>,
    clone_calls: AtomicUsize,
    sync_calls: AtomicUsize,
}

impl ScriptedGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_clone(&self, result: Result<String, SyncError>) {
        lock(&self.clone_results).push_back(result);
    }

    pub fn push_sync(&self, result: Result<String, SyncError>) {
        lock(&self.sync_results).push_back(result);
    }

    /// Makes every clone and sync sleep first.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn clone_calls(&self) -> usize {
        self.clone_calls.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    /// Identities attributed to each attempt, in order.
    pub fn users(&self) -> Vec<GitUser> {
        lock(&self.users).clone()
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GitBackend for ScriptedGit {
    async fn clone_repo(
        &self,
        _sandbox: &BackendRef,
        _url: &str,
        _git_ref: &str,
        user: &GitUser,
    ) -> Result<String, SyncError> {
        let n = self.clone_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.users).push(user.clone());
        self.pause().await;
        lock(&self.clone_results)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("clone-{}", n + 1)))
    }

    async fn sync(
        &self,
        _sandbox: &BackendRef,
        _git_ref: &str,
        _existing: &GitSyncStatus,
        user: &GitUser,
    ) -> Result<String, SyncError> {
        let n = self.sync_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.users).push(user.clone());
        self.pause().await;
        lock(&self.sync_results)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("sync-{}", n + 1)))
    }
}
