//! Git identity and working-tree synchronization state.

use std::env;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::validate::{Validate, ValidationResult};

/// Identity attributed to a git operation.
///
/// `token_ref` names where the auth token lives (an environment variable
/// on the orchestrator). The token value itself is never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GitUser {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ref: Option<String>,
}

impl GitUser {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            token_ref: None,
        }
    }

    /// Attaches a token reference.
    pub fn with_token_ref(mut self, token_ref: impl Into<String>) -> Self {
        self.token_ref = Some(token_ref.into());
        self
    }

    /// Builds the ambient identity from `GIT_AUTHOR_NAME`,
    /// `GIT_AUTHOR_EMAIL` and (optionally) `GIT_TOKEN_REF`.
    pub fn from_env() -> Option<Self> {
        let name = env::var("GIT_AUTHOR_NAME").ok()?;
        let email = env::var("GIT_AUTHOR_EMAIL").ok()?;
        let user = Self {
            name,
            email,
            token_ref: env::var("GIT_TOKEN_REF").ok(),
        };
        user.validate().is_valid().then_some(user)
    }
}

impl Validate for GitUser {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.name.trim().is_empty() {
            result.add_error("git user name cannot be empty");
        }
        if !self.email.contains('@') {
            result.add_error(format!("git user email '{}' is not an address", self.email));
        }
        if let Some(token_ref) = &self.token_ref {
            if token_ref.trim().is_empty() {
                result.add_error("git token reference cannot be empty");
            }
        }

        result
    }
}

/// Phase of repository synchronization for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GitSyncPhase {
    /// No sync was configured or started yet.
    #[default]
    NotRequested,
    /// Initial clone in progress.
    Cloning,
    /// Re-sync of an existing working tree in progress.
    Syncing,
    /// The working tree matches the last recorded commit.
    Synced,
    /// The latest attempt failed; see `GitSyncStatus::error`.
    SyncFailed,
}

impl GitSyncPhase {
    /// Returns true while a clone or sync attempt is running.
    pub fn is_in_flight(self) -> bool {
        matches!(self, GitSyncPhase::Cloning | GitSyncPhase::Syncing)
    }

    pub fn can_transition_to(self, next: GitSyncPhase) -> bool {
        use GitSyncPhase::*;
        matches!(
            (self, next),
            (NotRequested, Cloning)
                | (Cloning, Synced)
                | (Cloning, SyncFailed)
                | (Synced, Syncing)
                | (Syncing, Synced)
                | (Syncing, SyncFailed)
                | (SyncFailed, Syncing)
                | (SyncFailed, Cloning)
        )
    }
}

/// State of repository synchronization for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSyncStatus {
    pub phase: GitSyncPhase,
    /// Commit checked out by the last successful attempt.
    pub last_commit: Option<String>,
    /// Error from the last attempt, cleared on success.
    pub error: Option<SyncError>,
    /// Number of clone/sync attempts started.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for GitSyncStatus {
    fn default() -> Self {
        Self {
            phase: GitSyncPhase::NotRequested,
            last_commit: None,
            error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

impl GitSyncStatus {
    /// The phase a new attempt starts in: `Cloning` if nothing has been
    /// checked out yet, `Syncing` otherwise.
    pub fn next_attempt_phase(&self) -> GitSyncPhase {
        if self.last_commit.is_some() {
            GitSyncPhase::Syncing
        } else {
            GitSyncPhase::Cloning
        }
    }

    /// Marks the start of an attempt. Returns false if an attempt is
    /// already in flight.
    pub fn begin(&mut self) -> bool {
        let next = self.next_attempt_phase();
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.phase = next;
        self.attempts += 1;
        self.updated_at = Utc::now();
        true
    }

    /// Records a successful attempt.
    pub fn succeed(&mut self, commit: impl Into<String>) {
        self.phase = GitSyncPhase::Synced;
        self.last_commit = Some(commit.into());
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Records a failed attempt.
    pub fn fail(&mut self, error: SyncError) {
        self.phase = GitSyncPhase::SyncFailed;
        self.error = Some(error);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorKind;

    #[test]
    fn first_attempt_clones_then_later_attempts_sync() {
        let mut status = GitSyncStatus::default();
        assert!(status.begin());
        assert_eq!(status.phase, GitSyncPhase::Cloning);

        status.succeed("abc123");
        assert!(status.begin());
        assert_eq!(status.phase, GitSyncPhase::Syncing);
        assert_eq!(status.attempts, 2);
    }

    #[test]
    fn begin_refuses_while_in_flight() {
        let mut status = GitSyncStatus::default();
        assert!(status.begin());
        assert!(!status.begin());
        assert_eq!(status.attempts, 1);
    }

    #[test]
    fn failed_clone_retries_as_clone() {
        let mut status = GitSyncStatus::default();
        status.begin();
        status.fail(SyncError::new(SyncErrorKind::Network, "unreachable"));
        assert_eq!(status.phase, GitSyncPhase::SyncFailed);

        assert!(status.begin());
        assert_eq!(status.phase, GitSyncPhase::Cloning);
    }

    #[test]
    fn success_clears_previous_error() {
        let mut status = GitSyncStatus::default();
        status.begin();
        status.fail(SyncError::new(SyncErrorKind::Auth, "denied"));
        status.begin();
        status.succeed("def456");

        assert!(status.error.is_none());
        assert_eq!(status.last_commit.as_deref(), Some("def456"));
    }

    #[test]
    fn git_user_requires_name_and_email() {
        assert!(GitUser::new("Ada", "ada@example.com").validate().is_valid());
        assert!(!GitUser::new("", "ada@example.com").validate().is_valid());
        assert!(!GitUser::new("Ada", "nope").validate().is_valid());
    }

    #[test]
    fn git_user_token_ref_is_omitted_when_absent() {
        let json = serde_json::to_string(&GitUser::new("Ada", "ada@example.com")).unwrap();
        assert!(!json.contains("token_ref"));
    }
}
