//! Live references to running sandboxes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{BackendRef, ExecOutput};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::manager::ManagerCore;
use crate::types::{GitSyncStatus, GitUser, SandboxId, SandboxPhase, SandboxStatus, SessionConfig};

/// Mutable per-sandbox state. Written only by the manager's transition
/// logic while it holds the sandbox's transition lock.
#[derive(Debug)]
pub(crate) struct HandleState {
    pub status: SandboxStatus,
    pub last_activity: Instant,
    pub provision_started: Instant,
    pub query_failures: u32,
}

/// State shared between the registry and every clone of a handle.
pub(crate) struct HandleShared {
    pub id: SandboxId,
    pub backend_ref: BackendRef,
    pub config: SessionConfig,
    pub state: Mutex<HandleState>,
    /// Serializes lifecycle transitions for this sandbox.
    pub transition_lock: tokio::sync::Mutex<()>,
    pub git: watch::Sender<GitSyncStatus>,
    pub sync_task: Mutex<Option<JoinHandle<()>>>,
    pub eviction_scheduled: AtomicBool,
    pub evicted: AtomicBool,
    /// Set once the backend has confirmed `destroy`.
    pub released: AtomicBool,
    /// Execs and git operations currently running in the sandbox.
    active_ops: AtomicUsize,
}

impl HandleShared {
    pub fn new(
        id: SandboxId,
        backend_ref: BackendRef,
        config: SessionConfig,
        status: SandboxStatus,
        provision_started: Instant,
    ) -> Self {
        let (git, _) = watch::channel(GitSyncStatus::default());
        Self {
            id,
            backend_ref,
            config,
            state: Mutex::new(HandleState {
                status,
                last_activity: Instant::now(),
                provision_started,
                query_failures: 0,
            }),
            transition_lock: tokio::sync::Mutex::new(()),
            git,
            sync_task: Mutex::new(None),
            eviction_scheduled: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            released: AtomicBool::new(false),
            active_ops: AtomicUsize::new(0),
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> SandboxStatus {
        self.lock_state().status.clone()
    }

    pub fn phase(&self) -> SandboxPhase {
        self.lock_state().status.phase
    }

    pub fn touch(&self) {
        self.lock_state().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock_state().last_activity.elapsed()
    }

    pub fn provisioning_for(&self) -> Duration {
        self.lock_state().provision_started.elapsed()
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Marks work running inside the sandbox until the guard is dropped.
    /// A sandbox with work in flight is never idle.
    pub fn begin_activity(&self) -> Activity<'_> {
        self.active_ops.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Activity { shared: self }
    }

    pub fn is_busy(&self) -> bool {
        self.active_ops.load(Ordering::SeqCst) > 0
    }
}

/// Guard returned by [`HandleShared::begin_activity`].
pub(crate) struct Activity<'a> {
    shared: &'a HandleShared,
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        self.shared.touch();
        self.shared.active_ops.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live, addressable reference to one sandbox.
///
/// Handles are cheap to clone; all clones observe the same sandbox. Every
/// operation that changes state is carried out by the manager, so several
/// callers may safely hold the same handle concurrently. Once the sandbox
/// is evicted from the manager's registry, operations other than
/// [`status`](Self::status) fail with `SandboxNotFound`.
#[derive(Clone)]
pub struct SandboxHandle {
    shared: Arc<HandleShared>,
    core: Arc<ManagerCore>,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.shared.id)
            .field("backend_ref", &self.shared.backend_ref)
            .field("phase", &self.shared.phase())
            .finish()
    }
}

impl SandboxHandle {
    pub(crate) fn new(shared: Arc<HandleShared>, core: Arc<ManagerCore>) -> Self {
        Self { shared, core }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    pub fn id(&self) -> &SandboxId {
        &self.shared.id
    }

    pub fn backend_ref(&self) -> &BackendRef {
        &self.shared.backend_ref
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Cached status. Never contacts the backend.
    pub fn status(&self) -> SandboxStatus {
        self.shared.status()
    }

    /// Current git sync state.
    pub fn git_status(&self) -> GitSyncStatus {
        self.shared.git.borrow().clone()
    }

    /// Receiver that observes every git sync state change.
    pub fn watch_git_status(&self) -> watch::Receiver<GitSyncStatus> {
        self.shared.git.subscribe()
    }

    /// Whether the manager still tracks this sandbox.
    pub fn is_valid(&self) -> bool {
        !self.shared.is_evicted()
    }

    /// Queries the backend for the authoritative status and updates the
    /// cache. On failure the cache is left as it was.
    pub async fn refresh_status(&self) -> Result<SandboxStatus> {
        self.core.refresh_status(&self.shared).await
    }

    /// Runs a shell command. Requires the sandbox to be `Running`.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.core.exec(&self.shared, command, None).await
    }

    /// Like [`exec`](Self::exec), but aborts when `cancel` fires. A
    /// cancelled exec fails the sandbox, since the command's effects are
    /// unknown.
    pub async fn exec_with_cancel(&self, command: &str, cancel: &CancelToken) -> Result<ExecOutput> {
        self.core.exec(&self.shared, command, Some(cancel)).await
    }

    /// Stops the sandbox. If it has already stopped or failed this only
    /// releases backend resources that are still held.
    pub async fn stop(&self, reason: &str) -> Result<()> {
        self.core.stop(&self.shared, reason).await
    }

    /// Re-synchronizes the working tree, attributing the attempt to `user`
    /// (or the session owner / manager default when `None`).
    pub async fn resync(&self, user: Option<GitUser>) -> Result<GitSyncStatus> {
        self.core.resync(&self.shared, user).await
    }
}
