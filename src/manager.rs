//! The sandbox manager: registry, lifecycle state machine and orchestration.
//!
//! One manager is meant to exist per orchestrating process. It is created
//! explicitly and passed to whoever needs it; clones share the same state.
//!
//! Locking discipline:
//! - the registry is a `std::sync::RwLock` held only for map reads and
//!   inserts/removals, never across a backend call or an event publish;
//! - each sandbox has an async transition lock serializing its lifecycle
//!   transitions (stop, refresh, sync start), so a sandbox's status has a
//!   single writer at a time;
//! - provisioning attempts are deduplicated per [`ProvisionKey`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::backend::{
    BackendError, BackendRef, BackendState, ExecGitBackend, ExecOutput, GitBackend, SandboxBackend,
};
use crate::backoff::ExponentialBackoff;
use crate::cancel::CancelToken;
use crate::config::{ManagerConfig, ProvisionPolicy};
use crate::error::{Error, Result};
use crate::events::{EventBus, LiveEvents};
use crate::git_sync::GitSyncTracker;
use crate::handle::{HandleShared, SandboxHandle};
use crate::types::{
    EventKind, GitSyncPhase, GitUser, ProvisionKey, SandboxEvent, SandboxId, SandboxPhase,
    SandboxStatus, SessionConfig,
};
use crate::validate::Validate;

/// Proof that the caller holds a sandbox's transition lock.
type TransitionGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of a provisioning attempt, shared with callers waiting on it.
#[derive(Debug, Clone)]
enum ProvisionOutcome {
    Ready(SandboxId),
    Failed { id: SandboxId, reason: String },
    Abandoned,
}

/// Why the backend `create` did not produce a sandbox.
#[derive(Debug)]
enum CreateFailure {
    Backend(BackendError),
    Cancelled,
    TimedOut(Duration),
}

impl CreateFailure {
    fn reason(&self) -> String {
        match self {
            CreateFailure::Backend(e) => e.message.clone(),
            CreateFailure::Cancelled => "provisioning cancelled".to_string(),
            CreateFailure::TimedOut(after) => format!("provisioning timed out after {:?}", after),
        }
    }

    fn into_error(self, id: SandboxId) -> Error {
        match self {
            CreateFailure::Backend(e) if e.is_transient() => Error::BackendUnavailable(e.message),
            CreateFailure::Backend(e) => Error::ProvisionFailed {
                id,
                reason: e.message,
            },
            CreateFailure::Cancelled => Error::Cancelled(format!("provisioning of sandbox {}", id)),
            CreateFailure::TimedOut(after) => {
                Error::Timeout(format!("provisioning of sandbox {} after {:?}", id, after))
            }
        }
    }
}

/// Registration of an in-flight provisioning attempt. Dropping it releases
/// the key; followers see `Abandoned` unless an outcome was published.
struct ProvisionSlot<'a> {
    core: &'a ManagerCore,
    key: ProvisionKey,
    tx: watch::Sender<Option<ProvisionOutcome>>,
}

impl ProvisionSlot<'_> {
    fn complete(self, outcome: ProvisionOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for ProvisionSlot<'_> {
    fn drop(&mut self) {
        lock(&self.core.in_flight).remove(&self.key);
        self.tx.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(ProvisionOutcome::Abandoned);
            true
        });
    }
}

enum Claim<'a> {
    Leader(ProvisionSlot<'a>),
    Follower(watch::Receiver<Option<ProvisionOutcome>>),
}

/// Selects sandboxes in [`SandboxManager::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    phases: Vec<SandboxPhase>,
    owner: Option<String>,
}

impl ListFilter {
    /// Matches every sandbox.
    pub fn any() -> Self {
        Self::default()
    }

    /// Adds an accepted phase. With no phases, every phase matches.
    pub fn phase(mut self, phase: SandboxPhase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Only sandboxes whose session owner has this email.
    pub fn owner(mut self, email: impl Into<String>) -> Self {
        self.owner = Some(email.into());
        self
    }

    fn matches(&self, shared: &HandleShared) -> bool {
        if !self.phases.is_empty() && !self.phases.contains(&shared.phase()) {
            return false;
        }
        match &self.owner {
            Some(email) => shared
                .config
                .owner()
                .is_some_and(|owner| &owner.email == email),
            None => true,
        }
    }
}

/// What one watchdog sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Non-terminal sandboxes inspected.
    pub checked: usize,
    /// Sandboxes failed for exceeding the provisioning timeout.
    pub timed_out: usize,
    /// Sandboxes torn down for idling.
    pub idle_stopped: usize,
    /// Backend calls that found the backend unavailable.
    pub backend_errors: usize,
}

pub(crate) struct ManagerCore {
    backend: Arc<dyn SandboxBackend>,
    tracker: GitSyncTracker,
    bus: Arc<EventBus>,
    config: ManagerConfig,
    default_user: GitUser,
    registry: RwLock<HashMap<SandboxId, Arc<HandleShared>>>,
    tombstones: Mutex<HashSet<SandboxId>>,
    in_flight: Mutex<HashMap<ProvisionKey, watch::Receiver<Option<ProvisionOutcome>>>>,
    shutting_down: AtomicBool,
    shutdown: CancelToken,
}

impl ManagerCore {
    fn snapshot(&self) -> Vec<Arc<HandleShared>> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn lookup(&self, id: &SandboxId) -> Option<Arc<HandleShared>> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    fn is_tombstoned(&self, id: &SandboxId) -> bool {
        lock(&self.tombstones).contains(id)
    }

    fn ensure_valid(&self, shared: &HandleShared) -> Result<()> {
        if shared.is_evicted() {
            return Err(Error::SandboxNotFound(shared.id.clone()));
        }
        Ok(())
    }

    fn git_user_for(&self, config: &SessionConfig) -> GitUser {
        config
            .owner()
            .cloned()
            .unwrap_or_else(|| self.default_user.clone())
    }

    fn publish_phase(
        &self,
        id: &SandboxId,
        from: SandboxPhase,
        to: SandboxPhase,
        detail: Option<String>,
    ) {
        tracing::info!(sandbox_id = %id, from = %from, to = %to, detail = ?detail, "sandbox phase changed");
        self.bus
            .publish(SandboxEvent::phase_changed(id.clone(), from, to, detail));
    }

    fn publish_backend_error(&self, id: &SandboxId, message: &str, transient: bool) {
        self.bus.publish(SandboxEvent::new(
            id.clone(),
            EventKind::BackendError {
                message: message.to_string(),
                transient,
            },
        ));
    }

    // ---------------------------------------------------------------
    // Provisioning
    // ---------------------------------------------------------------

    fn claim(&self, key: &ProvisionKey) -> Result<Claim<'_>> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(rx) = in_flight.get(key) {
            return match self.config.provision_policy {
                ProvisionPolicy::Fail => Err(Error::ProvisionInProgress {
                    key: key.to_string(),
                }),
                ProvisionPolicy::Wait => Ok(Claim::Follower(rx.clone())),
            };
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.clone(), rx);
        Ok(Claim::Leader(ProvisionSlot {
            core: self,
            key: key.clone(),
            tx,
        }))
    }

    async fn follow(
        self: &Arc<Self>,
        mut rx: watch::Receiver<Option<ProvisionOutcome>>,
        key: &ProvisionKey,
    ) -> Result<SandboxHandle> {
        tracing::info!(key = %key, "waiting for in-flight provisioning");
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(ProvisionOutcome::Ready(id)) => self.get(&id),
            Some(ProvisionOutcome::Failed { id, reason }) => Err(Error::ProvisionFailed { id, reason }),
            Some(ProvisionOutcome::Abandoned) | None => Err(Error::Cancelled(format!(
                "in-flight provisioning for {} was abandoned",
                key
            ))),
        }
    }

    pub(crate) async fn provision(
        self: &Arc<Self>,
        config: SessionConfig,
        cancel: Option<&CancelToken>,
    ) -> Result<SandboxHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        config.validate().into_result()?;

        let key = config.provision_key();
        let slot = match self.claim(&key)? {
            Claim::Leader(slot) => slot,
            Claim::Follower(rx) => return self.follow(rx, &key).await,
        };

        let id = SandboxId::generate();
        let started = Instant::now();
        let mut status = SandboxStatus::pending();
        status.transition(SandboxPhase::Provisioning, None);
        tracing::info!(sandbox_id = %id, key = %key, backend = self.backend.name(), "provisioning sandbox");
        self.publish_phase(&id, SandboxPhase::Pending, SandboxPhase::Provisioning, None);

        let (backend_ref, state) = match self.create_in_backend(&id, &config, cancel).await {
            Ok(created) => created,
            Err(failure) => {
                let reason = failure.reason();
                if let CreateFailure::Backend(e) = &failure {
                    self.publish_backend_error(&id, &e.message, e.is_transient());
                }
                self.abandon(&id, &reason);
                slot.complete(ProvisionOutcome::Failed {
                    id: id.clone(),
                    reason,
                });
                return Err(failure.into_error(id));
            }
        };

        let shared = Arc::new(HandleShared::new(
            id.clone(),
            backend_ref,
            config,
            status,
            started,
        ));
        {
            let guard = shared.transition_lock.lock().await;
            self.observe(&shared, &guard, state);
        }

        if shared.phase().is_terminal() {
            let reason = shared
                .status()
                .detail
                .unwrap_or_else(|| "backend failed during provisioning".to_string());
            self.destroy_quietly(&shared).await;
            slot.complete(ProvisionOutcome::Failed {
                id: id.clone(),
                reason: reason.clone(),
            });
            return Err(Error::ProvisionFailed { id, reason });
        }

        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), shared.clone());

        if self.shutting_down.load(Ordering::SeqCst) {
            let _ = self.stop(&shared, "manager shut down during provisioning").await;
            self.evict(&shared);
            slot.complete(ProvisionOutcome::Failed {
                id,
                reason: "manager shut down during provisioning".to_string(),
            });
            return Err(Error::ShuttingDown);
        }

        slot.complete(ProvisionOutcome::Ready(id));
        Ok(SandboxHandle::new(shared, self.clone()))
    }

    /// Calls `backend.create`, bounded by the provisioning timeout and the
    /// caller's cancellation. An abandoned create keeps running in the
    /// background and whatever it produces is destroyed.
    async fn create_in_backend(
        &self,
        id: &SandboxId,
        config: &SessionConfig,
        cancel: Option<&CancelToken>,
    ) -> std::result::Result<(BackendRef, BackendState), CreateFailure> {
        let backend = self.backend.clone();
        let (task_id, task_config) = (id.clone(), config.clone());
        let mut task = tokio::spawn(async move { backend.create(&task_id, &task_config).await });
        let timeout = self.config.provision_timeout;

        let failure = tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(result) => result.map_err(CreateFailure::Backend),
                    Err(e) => Err(CreateFailure::Backend(BackendError::fatal(format!(
                        "create task failed: {}",
                        e
                    )))),
                };
            }
            _ = wait_cancelled(cancel) => CreateFailure::Cancelled,
            _ = tokio::time::sleep(timeout) => CreateFailure::TimedOut(timeout),
        };

        tracing::warn!(sandbox_id = %id, reason = %failure.reason(), "abandoning backend create");
        let backend = self.backend.clone();
        let orphan_id = id.clone();
        tokio::spawn(async move {
            if let Ok(Ok((backend_ref, _))) = task.await {
                if let Err(e) = backend.destroy(&backend_ref).await {
                    tracing::warn!(sandbox_id = %orphan_id, error = %e, "failed to destroy abandoned sandbox");
                }
            }
        });
        Err(failure)
    }

    /// Records a provisioning failure for a sandbox that never got a handle.
    fn abandon(&self, id: &SandboxId, reason: &str) {
        self.publish_phase(
            id,
            SandboxPhase::Provisioning,
            SandboxPhase::Failed,
            Some(reason.to_string()),
        );
        lock(&self.tombstones).insert(id.clone());
        self.bus.retire(id);
    }

    // ---------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------

    /// Applies one lifecycle transition and publishes it.
    fn transition(
        self: &Arc<Self>,
        shared: &Arc<HandleShared>,
        _guard: &TransitionGuard<'_>,
        next: SandboxPhase,
        detail: Option<String>,
    ) -> bool {
        if next == SandboxPhase::Stopping || next.is_terminal() {
            self.tracker.cancel(shared, &self.git_user_for(&shared.config));
        }

        let previous = shared.lock_state().status.transition(next, detail.clone());
        let Some(from) = previous else {
            tracing::warn!(sandbox_id = %shared.id, phase = %shared.phase(), next = %next, "ignoring illegal transition");
            return false;
        };
        self.publish_phase(&shared.id, from, next, detail);

        if next == SandboxPhase::Running {
            self.start_git_sync(shared);
        } else if next.is_terminal() {
            self.schedule_eviction(shared);
        }
        true
    }

    /// Moves the cached status towards what the backend reports.
    fn observe(
        self: &Arc<Self>,
        shared: &Arc<HandleShared>,
        guard: &TransitionGuard<'_>,
        state: BackendState,
    ) {
        let current = shared.phase();
        let target = state.phase();
        if current == target || current.is_terminal() {
            return;
        }

        match state {
            BackendState::Failed(detail) => {
                self.publish_backend_error(&shared.id, &detail, false);
                self.transition(shared, guard, SandboxPhase::Failed, Some(detail));
            }
            _ if current == SandboxPhase::Provisioning
                && matches!(target, SandboxPhase::Stopping | SandboxPhase::Stopped) =>
            {
                self.transition(
                    shared,
                    guard,
                    SandboxPhase::Failed,
                    Some("sandbox exited before it was running".to_string()),
                );
            }
            _ => match current.path_to(target) {
                Some(path) => {
                    for (i, phase) in path.into_iter().enumerate() {
                        let detail = (i == 0 && phase == SandboxPhase::Stopping)
                            .then(|| "backend reported exit".to_string());
                        self.transition(shared, guard, phase, detail);
                    }
                }
                None => {
                    tracing::debug!(
                        sandbox_id = %shared.id,
                        cached = %current,
                        reported = %target,
                        "ignoring backend status behind cached phase"
                    );
                }
            },
        }
    }

    fn start_git_sync(&self, shared: &Arc<HandleShared>) {
        if !shared.config.sync_git() || shared.git.borrow().phase != GitSyncPhase::NotRequested {
            return;
        }
        let user = self.git_user_for(&shared.config);
        match self.tracker.begin(shared, &user) {
            Ok(phase) => self.tracker.spawn(shared.clone(), phase, user),
            Err(e) => tracing::warn!(sandbox_id = %shared.id, error = %e, "could not start git sync"),
        }
    }

    fn schedule_eviction(self: &Arc<Self>, shared: &Arc<HandleShared>) {
        if shared.eviction_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.config.grace_period;
        if grace.is_zero() {
            self.evict(shared);
            return;
        }

        tracing::debug!(sandbox_id = %shared.id, grace = ?grace, "eviction scheduled");
        let core = Arc::downgrade(self);
        let shared = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(core) = core.upgrade() {
                core.evict(&shared);
            }
        });
    }

    fn evict(&self, shared: &HandleShared) {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&shared.id)
            .is_some();
        lock(&self.tombstones).insert(shared.id.clone());
        shared.evicted.store(true, Ordering::SeqCst);
        self.bus.retire(&shared.id);
        if removed {
            tracing::info!(sandbox_id = %shared.id, "sandbox evicted from registry");
        }
    }

    /// Releases backend resources unless that already succeeded. Callers
    /// hold the transition lock.
    async fn destroy_quietly(&self, shared: &HandleShared) {
        if shared.is_released() {
            return;
        }
        match self.backend.destroy(&shared.backend_ref).await {
            Ok(()) => shared.released.store(true, Ordering::SeqCst),
            Err(e) => {
                tracing::warn!(sandbox_id = %shared.id, error = %e, "best-effort destroy failed")
            }
        }
    }

    /// Fails a sandbox and releases its backend resources.
    async fn fail(self: &Arc<Self>, shared: &Arc<HandleShared>, reason: String) {
        let guard = shared.transition_lock.lock().await;
        if shared.phase().is_terminal() {
            return;
        }
        self.transition(shared, &guard, SandboxPhase::Failed, Some(reason));
        self.destroy_quietly(shared).await;
    }

    // ---------------------------------------------------------------
    // Handle operations
    // ---------------------------------------------------------------

    pub(crate) async fn refresh_status(
        self: &Arc<Self>,
        shared: &Arc<HandleShared>,
    ) -> Result<SandboxStatus> {
        self.ensure_valid(shared)?;
        let guard = shared.transition_lock.lock().await;
        if shared.phase().is_terminal() {
            return Ok(shared.status());
        }

        let result = match self.backend.query(&shared.backend_ref).await {
            Ok(state) => {
                shared.lock_state().query_failures = 0;
                self.observe(shared, &guard, state);
                Ok(shared.status())
            }
            Err(e) => {
                let failures = {
                    let mut state = shared.lock_state();
                    state.query_failures += 1;
                    state.query_failures
                };
                let threshold = self.config.query_failure_threshold;
                tracing::warn!(
                    sandbox_id = %shared.id,
                    error = %e,
                    failures,
                    threshold,
                    "status query failed"
                );
                self.publish_backend_error(&shared.id, &e.message, e.is_transient());

                if failures >= threshold {
                    self.transition(
                        shared,
                        &guard,
                        SandboxPhase::Failed,
                        Some(format!(
                            "status query failed {} times in a row: {}",
                            failures, e.message
                        )),
                    );
                }
                Err(e.into())
            }
        };

        if shared.phase().is_terminal() {
            self.destroy_quietly(shared).await;
        }
        result
    }

    pub(crate) async fn exec(
        self: &Arc<Self>,
        shared: &Arc<HandleShared>,
        command: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<ExecOutput> {
        self.ensure_valid(shared)?;
        let phase = shared.phase();
        if phase != SandboxPhase::Running {
            return Err(Error::SandboxNotRunning {
                id: shared.id.clone(),
                phase,
            });
        }

        let activity = shared.begin_activity();
        let result = tokio::select! {
            result = self.backend.exec(&shared.backend_ref, command) => result,
            _ = wait_cancelled(cancel) => {
                tracing::warn!(sandbox_id = %shared.id, command = %command, "exec cancelled, failing sandbox");
                self.bus.publish(SandboxEvent::new(
                    shared.id.clone(),
                    EventKind::ExecFailed {
                        command: command.to_string(),
                        diagnostics: "cancelled".to_string(),
                    },
                ));
                drop(activity);
                self.fail(shared, format!("exec cancelled: {}", command)).await;
                return Err(Error::Cancelled(format!("exec in sandbox {}", shared.id)));
            }
        };
        drop(activity);

        match result {
            Ok(output) => {
                tracing::debug!(sandbox_id = %shared.id, exit_code = output.exit_code, "exec completed");
                self.bus.publish(SandboxEvent::new(
                    shared.id.clone(),
                    EventKind::ExecCompleted {
                        command: command.to_string(),
                        exit_code: output.exit_code,
                    },
                ));
                Ok(output)
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %shared.id, error = %e, "exec failed");
                self.bus.publish(SandboxEvent::new(
                    shared.id.clone(),
                    EventKind::ExecFailed {
                        command: command.to_string(),
                        diagnostics: e.message.clone(),
                    },
                ));
                if e.is_transient() {
                    Err(Error::BackendUnavailable(e.message))
                } else {
                    Err(Error::ExecFailed {
                        id: shared.id.clone(),
                        diagnostics: e.message,
                    })
                }
            }
        }
    }

    pub(crate) async fn stop(self: &Arc<Self>, shared: &Arc<HandleShared>, reason: &str) -> Result<()> {
        let guard = shared.transition_lock.lock().await;
        match shared.phase() {
            SandboxPhase::Stopped | SandboxPhase::Failed => {
                self.destroy_quietly(shared).await;
                return Ok(());
            }
            SandboxPhase::Pending | SandboxPhase::Provisioning => {
                self.transition(
                    shared,
                    &guard,
                    SandboxPhase::Failed,
                    Some(format!("stopped before running: {}", reason)),
                );
                self.destroy_quietly(shared).await;
                return Ok(());
            }
            SandboxPhase::Running => {
                self.transition(shared, &guard, SandboxPhase::Stopping, Some(reason.to_string()));
            }
            SandboxPhase::Stopping => {}
        }

        match self.backend.destroy(&shared.backend_ref).await {
            Ok(()) => {
                shared.released.store(true, Ordering::SeqCst);
                self.transition(shared, &guard, SandboxPhase::Stopped, None);
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox_id = %shared.id, error = %e, "backend teardown failed");
                self.publish_backend_error(&shared.id, &e.message, e.is_transient());
                self.transition(
                    shared,
                    &guard,
                    SandboxPhase::Failed,
                    Some(format!("teardown failed: {}", e.message)),
                );
                Err(e.into())
            }
        }
    }

    pub(crate) async fn resync(
        self: &Arc<Self>,
        shared: &Arc<HandleShared>,
        user: Option<GitUser>,
    ) -> Result<crate::types::GitSyncStatus> {
        self.ensure_valid(shared)?;
        let user = user.unwrap_or_else(|| self.git_user_for(&shared.config));
        let phase = {
            let _guard = shared.transition_lock.lock().await;
            self.tracker.begin(shared, &user)?
        };
        self.tracker.run(shared, phase, &user).await
    }

    // ---------------------------------------------------------------
    // Registry-wide operations
    // ---------------------------------------------------------------

    fn get(self: &Arc<Self>, id: &SandboxId) -> Result<SandboxHandle> {
        self.lookup(id)
            .map(|shared| SandboxHandle::new(shared, self.clone()))
            .ok_or_else(|| Error::SandboxNotFound(id.clone()))
    }

    async fn teardown(self: &Arc<Self>, id: &SandboxId, reason: &str) -> Result<()> {
        let Some(shared) = self.lookup(id) else {
            if self.is_tombstoned(id) {
                return Ok(());
            }
            return Err(Error::SandboxNotFound(id.clone()));
        };
        let result = self.stop(&shared, reason).await;
        self.schedule_eviction(&shared);
        result
    }

    async fn sweep(self: &Arc<Self>) -> SweepReport {
        let mut report = SweepReport::default();

        for shared in self.snapshot() {
            match shared.phase() {
                SandboxPhase::Provisioning => {
                    report.checked += 1;
                    if shared.provisioning_for() >= self.config.provision_timeout {
                        self.fail(
                            &shared,
                            format!(
                                "provisioning timed out after {:?}",
                                self.config.provision_timeout
                            ),
                        )
                        .await;
                        report.timed_out += 1;
                    } else if let Err(Error::BackendUnavailable(_)) =
                        self.refresh_status(&shared).await
                    {
                        report.backend_errors += 1;
                    }
                }
                SandboxPhase::Running => {
                    report.checked += 1;
                    let Some(idle_timeout) = self.config.idle_timeout else {
                        continue;
                    };
                    if shared.is_busy() || shared.idle_for() < idle_timeout {
                        continue;
                    }
                    tracing::info!(sandbox_id = %shared.id, idle = ?shared.idle_for(), "tearing down idle sandbox");
                    match self.teardown(&shared.id, "idle timeout").await {
                        Ok(()) => report.idle_stopped += 1,
                        Err(Error::BackendUnavailable(_)) => report.backend_errors += 1,
                        Err(e) => {
                            tracing::warn!(sandbox_id = %shared.id, error = %e, "idle teardown failed")
                        }
                    }
                }
                _ => {}
            }
        }

        report
    }

    fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let core = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.watchdog_interval;
        let mut backoff = ExponentialBackoff::new(interval, self.config.watchdog_max_backoff);

        tokio::spawn(async move {
            let mut delay = interval;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(core) = core.upgrade() else {
                    break;
                };
                let report = core.sweep().await;
                drop(core);

                delay = next_sweep_delay(&mut backoff, &report);
                if report.backend_errors > 0 {
                    tracing::warn!(?report, next_sweep = ?delay, "backend unavailable during sweep, backing off");
                } else {
                    tracing::trace!(?report, "watchdog sweep finished");
                }
            }
            tracing::debug!("watchdog stopped");
        })
    }

    async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let handles = self.snapshot();
        tracing::info!(sandboxes = handles.len(), "shutting down sandbox manager");

        let mut tasks = JoinSet::new();
        for shared in handles {
            let core = self.clone();
            tasks.spawn(async move {
                let result = core.stop(&shared, "manager shutdown").await;
                core.evict(&shared);
                (shared.id.clone(), result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "teardown failed during shutdown");
                    failures.push((id, e));
                }
                Err(e) => tracing::error!(error = %e, "teardown task panicked during shutdown"),
            }
        }

        self.bus.close();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(failures))
        }
    }
}

impl Drop for ManagerCore {
    fn drop(&mut self) {
        let live = self
            .registry
            .get_mut()
            .map(|registry| registry.len())
            .unwrap_or_default();
        if live > 0 && !self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(sandboxes = live, "sandbox manager dropped without shutdown()");
        }
    }
}

/// Delay before the next watchdog sweep: the base interval after a clean
/// sweep, growing from it while the backend stays unavailable.
fn next_sweep_delay(backoff: &mut ExponentialBackoff, report: &SweepReport) -> Duration {
    if report.backend_errors > 0 {
        backoff.next_delay()
    } else {
        backoff.reset();
        backoff.current()
    }
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Builder for [`SandboxManager`].
pub struct SandboxManagerBuilder {
    backend: Arc<dyn SandboxBackend>,
    git: Option<Arc<dyn GitBackend>>,
    config: ManagerConfig,
    default_user: Option<GitUser>,
}

impl SandboxManagerBuilder {
    /// Git backend used for working-tree sync. Defaults to running `git`
    /// through the sandbox backend's exec.
    pub fn git(mut self, git: Arc<dyn GitBackend>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity for git operations of sessions without an owner. Defaults
    /// to the ambient identity from the environment.
    pub fn default_git_user(mut self, user: GitUser) -> Self {
        self.default_user = Some(user);
        self
    }

    /// Validates the configuration and creates the manager.
    pub fn build(self) -> Result<SandboxManager> {
        let Self {
            backend,
            git,
            config,
            default_user,
        } = self;
        config.validate().into_result()?;
        if let Some(user) = &default_user {
            user.validate().into_result()?;
        }

        let bus = Arc::new(EventBus::from_config(&config));
        let git: Arc<dyn GitBackend> = match git {
            Some(git) => git,
            None => Arc::new(ExecGitBackend::new(backend.clone())),
        };
        let default_user = default_user
            .or_else(GitUser::from_env)
            .unwrap_or_else(|| GitUser::new("inspect-sandbox", "inspect-sandbox@localhost"));

        tracing::debug!(backend = backend.name(), "sandbox manager created");
        Ok(SandboxManager {
            core: Arc::new(ManagerCore {
                backend,
                tracker: GitSyncTracker::new(git, bus.clone()),
                bus,
                config,
                default_user,
                registry: RwLock::new(HashMap::new()),
                tombstones: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                shutdown: CancelToken::new(),
            }),
        })
    }
}

/// Registry and orchestrator for sandboxes.
#[derive(Clone)]
pub struct SandboxManager {
    core: Arc<ManagerCore>,
}

impl SandboxManager {
    pub fn builder(backend: Arc<dyn SandboxBackend>) -> SandboxManagerBuilder {
        SandboxManagerBuilder {
            backend,
            git: None,
            config: ManagerConfig::default(),
            default_user: None,
        }
    }

    /// Creates a manager with the default configuration.
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Result<Self> {
        Self::builder(backend).build()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.core.config
    }

    /// Provisions a sandbox for `config`.
    ///
    /// Returns a handle in `Provisioning` or `Running`. A second request
    /// with the same [`ProvisionKey`] while this one is in flight either
    /// fails with `ProvisionInProgress` or shares this request's outcome,
    /// depending on [`ProvisionPolicy`].
    pub async fn provision(&self, config: SessionConfig) -> Result<SandboxHandle> {
        self.core.provision(config, None).await
    }

    /// Like [`provision`](Self::provision), but gives up when `cancel`
    /// fires. The abandoned sandbox is destroyed once the backend returns.
    pub async fn provision_with_cancel(
        &self,
        config: SessionConfig,
        cancel: &CancelToken,
    ) -> Result<SandboxHandle> {
        self.core.provision(config, Some(cancel)).await
    }

    /// Looks up a registered sandbox.
    pub fn get(&self, id: &SandboxId) -> Result<SandboxHandle> {
        self.core.get(id)
    }

    /// Snapshot of the registered sandboxes matching `filter`, oldest first.
    pub fn list(&self, filter: &ListFilter) -> std::vec::IntoIter<SandboxHandle> {
        let mut matching: Vec<Arc<HandleShared>> = self
            .core
            .snapshot()
            .into_iter()
            .filter(|shared| filter.matches(shared))
            .collect();
        matching.sort_by_key(|shared| shared.status().created_at);
        matching
            .into_iter()
            .map(|shared| SandboxHandle::new(shared, self.core.clone()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Stops a sandbox and evicts it after the grace period. Tearing down
    /// an already-evicted sandbox succeeds without doing anything.
    pub async fn teardown(&self, id: &SandboxId, reason: &str) -> Result<()> {
        self.core.teardown(id, reason).await
    }

    /// Enforces timeouts once: fails sandboxes stuck provisioning, polls
    /// provisioning sandboxes for confirmation and tears down idle ones.
    pub async fn sweep(&self) -> SweepReport {
        self.core.sweep().await
    }

    /// Runs [`sweep`](Self::sweep) periodically until shutdown.
    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        self.core.spawn_watchdog()
    }

    /// Replays retained events, optionally for one sandbox.
    pub fn subscribe_history(&self, id: Option<&SandboxId>) -> std::vec::IntoIter<SandboxEvent> {
        self.core.bus.subscribe_history(id)
    }

    /// Follows new events, optionally for one sandbox, until shutdown.
    pub fn subscribe_live(&self, id: Option<SandboxId>) -> LiveEvents {
        self.core.bus.subscribe_live(id)
    }

    /// Tears down every sandbox, continuing past failures, then closes the
    /// event bus. Failures are aggregated into `Error::Shutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{ScriptedBackend, ScriptedGit};

    fn manager_with(config: ManagerConfig) -> (SandboxManager, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = SandboxManager::builder(backend.clone())
            .git(Arc::new(ScriptedGit::new()))
            .config(config)
            .default_git_user(GitUser::new("Bot", "bot@example.com"))
            .build()
            .unwrap();
        (manager, backend)
    }

    fn session() -> SessionConfig {
        SessionConfig::builder("r").sync_git(false).build().unwrap()
    }

    #[tokio::test]
    async fn transition_guard_rejects_illegal_moves() {
        let (manager, _) = manager_with(ManagerConfig::default());
        let handle = manager.provision(session()).await.unwrap();
        let shared = handle.shared().clone();

        let guard = shared.transition_lock.lock().await;
        assert!(!manager.core.transition(&shared, &guard, SandboxPhase::Stopped, None));
        assert_eq!(shared.phase(), SandboxPhase::Running);
    }

    #[tokio::test]
    async fn observe_walks_through_stopping_on_external_exit() {
        let (manager, backend) = manager_with(ManagerConfig::default());
        let handle = manager.provision(session()).await.unwrap();
        backend.set_state(handle.backend_ref(), BackendState::Exited);

        let status = handle.refresh_status().await.unwrap();
        assert_eq!(status.phase, SandboxPhase::Stopped);

        let phases: Vec<_> = manager
            .subscribe_history(Some(handle.id()))
            .filter_map(|e| e.phase())
            .collect();
        assert_eq!(
            phases,
            vec![
                SandboxPhase::Provisioning,
                SandboxPhase::Running,
                SandboxPhase::Stopping,
                SandboxPhase::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn exit_during_provisioning_fails_the_sandbox() {
        let (manager, backend) = manager_with(ManagerConfig::default());
        backend.push_create(Ok(BackendState::Starting));
        let handle = manager.provision(session()).await.unwrap();
        assert_eq!(handle.status().phase, SandboxPhase::Provisioning);

        backend.set_state(handle.backend_ref(), BackendState::Exited);
        let status = handle.refresh_status().await.unwrap();
        assert_eq!(status.phase, SandboxPhase::Failed);
    }

    #[tokio::test]
    async fn list_filters_by_phase_and_owner() {
        let (manager, backend) = manager_with(ManagerConfig::default());
        let owned = SessionConfig::builder("a")
            .owner(GitUser::new("Ada", "ada@example.com"))
            .sync_git(false)
            .build()
            .unwrap();
        manager.provision(owned).await.unwrap();
        backend.push_create(Ok(BackendState::Starting));
        manager.provision(session()).await.unwrap();

        assert_eq!(manager.list(&ListFilter::any()).count(), 2);
        assert_eq!(
            manager
                .list(&ListFilter::any().phase(SandboxPhase::Provisioning))
                .count(),
            1
        );
        let ada: Vec<_> = manager
            .list(&ListFilter::any().owner("ada@example.com"))
            .collect();
        assert_eq!(ada.len(), 1);
        assert_eq!(ada[0].config().repo_url(), "a");
    }

    #[tokio::test]
    async fn sweep_fails_sandboxes_stuck_in_provisioning() {
        let config = ManagerConfig::default().with_provision_timeout(Duration::from_millis(20));
        let (manager, backend) = manager_with(config);
        backend.push_create(Ok(BackendState::Starting));
        let handle = manager.provision(session()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = manager.sweep().await;

        assert_eq!(report.timed_out, 1);
        assert_eq!(handle.status().phase, SandboxPhase::Failed);
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn sweep_confirms_provisioning_sandboxes() {
        let (manager, backend) = manager_with(ManagerConfig::default());
        backend.push_create(Ok(BackendState::Starting));
        let handle = manager.provision(session()).await.unwrap();
        backend.set_state(handle.backend_ref(), BackendState::Running);

        let report = manager.sweep().await;
        assert_eq!(report.checked, 1);
        assert_eq!(handle.status().phase, SandboxPhase::Running);
    }

    #[tokio::test]
    async fn sweep_tears_down_idle_sandboxes() {
        let config = ManagerConfig::default()
            .with_idle_timeout(Duration::from_millis(10))
            .with_grace_period(Duration::ZERO);
        let (manager, _) = manager_with(config);
        let handle = manager.provision(session()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = manager.sweep().await;

        assert_eq!(report.idle_stopped, 1);
        assert_eq!(handle.status().phase, SandboxPhase::Stopped);
        assert!(matches!(
            manager.get(handle.id()),
            Err(Error::SandboxNotFound(_))
        ));
    }

    #[test]
    fn watchdog_backs_off_from_the_base_interval() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(120));
        let failing = SweepReport {
            backend_errors: 1,
            ..SweepReport::default()
        };

        assert_eq!(next_sweep_delay(&mut backoff, &failing), Duration::from_secs(5));
        assert_eq!(next_sweep_delay(&mut backoff, &failing), Duration::from_secs(10));
        assert_eq!(next_sweep_delay(&mut backoff, &failing), Duration::from_secs(20));
        assert_eq!(
            next_sweep_delay(&mut backoff, &SweepReport::default()),
            Duration::from_secs(5)
        );
        assert_eq!(next_sweep_delay(&mut backoff, &failing), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn watchdog_stops_on_shutdown() {
        let config = ManagerConfig {
            watchdog_interval: Duration::from_millis(10),
            watchdog_max_backoff: Duration::from_millis(40),
            ..ManagerConfig::default()
        };
        let (manager, _) = manager_with(config);
        let watchdog = manager.spawn_watchdog();

        manager.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), watchdog)
            .await
            .expect("watchdog did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn provision_after_shutdown_is_rejected() {
        let (manager, backend) = manager_with(ManagerConfig::default());
        manager.shutdown().await.unwrap();

        let err = manager.provision(session()).await.unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert_eq!(backend.create_calls(), 0);
    }

    #[test]
    fn invalid_manager_config_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = SandboxManager::builder(backend)
            .config(ManagerConfig::default().with_query_failure_threshold(0))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
