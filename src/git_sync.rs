//! Tracks clone and sync attempts for each sandbox's working tree.
//!
//! An attempt is split in two: [`GitSyncTracker::begin`] marks the status
//! as in flight and must run under the sandbox's transition lock, so a
//! concurrent stop either sees the attempt and cancels it or prevents it
//! from starting. [`GitSyncTracker::run`] then talks to the git backend
//! without holding any lock.

use std::sync::Arc;

use crate::backend::GitBackend;
use crate::error::{Error, Result, SyncError, SyncErrorKind};
use crate::events::EventBus;
use crate::handle::HandleShared;
use crate::types::{EventKind, GitSyncPhase, GitSyncStatus, GitUser, SandboxEvent, SandboxPhase};

#[derive(Clone)]
pub(crate) struct GitSyncTracker {
    git: Arc<dyn GitBackend>,
    bus: Arc<EventBus>,
}

impl GitSyncTracker {
    pub fn new(git: Arc<dyn GitBackend>, bus: Arc<EventBus>) -> Self {
        Self { git, bus }
    }

    /// Marks a new attempt as started and returns its phase.
    pub fn begin(&self, shared: &HandleShared, user: &GitUser) -> Result<GitSyncPhase> {
        let phase = shared.phase();
        if !matches!(phase, SandboxPhase::Running | SandboxPhase::Provisioning) {
            return Err(Error::SandboxNotRunning {
                id: shared.id.clone(),
                phase,
            });
        }

        let mut started = None;
        shared.git.send_if_modified(|status| {
            if status.begin() {
                started = Some(status.phase);
                true
            } else {
                false
            }
        });
        let Some(sync_phase) = started else {
            return Err(SyncError::new(SyncErrorKind::Other, "a git sync is already in progress").into());
        };

        tracing::info!(sandbox_id = %shared.id, phase = ?sync_phase, user = %user.email, "git sync started");
        self.bus.publish(SandboxEvent::new(
            shared.id.clone(),
            EventKind::SyncStarted {
                phase: sync_phase,
                user: user.clone(),
            },
        ));
        Ok(sync_phase)
    }

    /// Performs an attempt started by [`begin`](Self::begin).
    pub async fn run(
        &self,
        shared: &HandleShared,
        phase: GitSyncPhase,
        user: &GitUser,
    ) -> Result<GitSyncStatus> {
        let activity = shared.begin_activity();
        let config = &shared.config;
        let result = match phase {
            GitSyncPhase::Cloning => {
                self.git
                    .clone_repo(&shared.backend_ref, config.repo_url(), config.git_ref(), user)
                    .await
            }
            _ => {
                let existing = shared.git.borrow().clone();
                self.git
                    .sync(&shared.backend_ref, config.git_ref(), &existing, user)
                    .await
            }
        };
        drop(activity);

        // A stop may have cancelled the attempt in the meantime.
        let mut applied = false;
        shared.git.send_if_modified(|status| {
            if status.phase != phase {
                return false;
            }
            match &result {
                Ok(commit) => status.succeed(commit.clone()),
                Err(error) => status.fail(error.clone()),
            }
            applied = true;
            true
        });
        if !applied {
            return Err(Error::Cancelled(format!(
                "git sync for sandbox {} was cancelled",
                shared.id
            )));
        }

        match result {
            Ok(commit) => {
                tracing::info!(sandbox_id = %shared.id, commit = %commit, "git sync completed");
                self.bus.publish(SandboxEvent::new(
                    shared.id.clone(),
                    EventKind::SyncCompleted {
                        commit,
                        user: user.clone(),
                    },
                ));
                Ok(shared.git.borrow().clone())
            }
            Err(error) => {
                tracing::warn!(sandbox_id = %shared.id, error = %error, "git sync failed");
                self.bus.publish(SandboxEvent::new(
                    shared.id.clone(),
                    EventKind::SyncFailed {
                        error: error.clone(),
                        user: user.clone(),
                    },
                ));
                Err(error.into())
            }
        }
    }

    /// Runs an attempt in the background. The task is aborted by
    /// [`cancel`](Self::cancel).
    pub fn spawn(&self, shared: Arc<HandleShared>, phase: GitSyncPhase, user: GitUser) {
        let tracker = self.clone();
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            // Failures are already recorded in the status and the event log.
            let _ = tracker.run(&task_shared, phase, &user).await;
        });

        let previous = shared
            .sync_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Aborts an in-flight attempt and records it as cancelled.
    pub fn cancel(&self, shared: &HandleShared, user: &GitUser) {
        let task = shared
            .sync_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let error = SyncError::new(SyncErrorKind::Cancelled, "sandbox stopped during git sync");
        let mut cancelled = false;
        shared.git.send_if_modified(|status| {
            if !status.phase.is_in_flight() {
                return false;
            }
            status.fail(error.clone());
            cancelled = true;
            true
        });

        if cancelled {
            tracing::info!(sandbox_id = %shared.id, "git sync cancelled");
            self.bus.publish(SandboxEvent::new(
                shared.id.clone(),
                EventKind::SyncFailed {
                    error,
                    user: user.clone(),
                },
            ));
        }
    }
}
