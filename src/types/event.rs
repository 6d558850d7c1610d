//! Immutable facts about a sandbox's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

use super::{GitSyncPhase, GitUser, SandboxId, SandboxPhase};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The sandbox moved to a new lifecycle phase.
    PhaseChanged {
        from: SandboxPhase,
        to: SandboxPhase,
        detail: Option<String>,
    },
    /// The backend reported an error. Emitted before any transition the
    /// error causes.
    BackendError { message: String, transient: bool },
    /// A command finished inside the sandbox.
    ExecCompleted { command: String, exit_code: i32 },
    /// The backend could not run a command.
    ExecFailed { command: String, diagnostics: String },
    /// A clone or sync attempt started.
    SyncStarted { phase: GitSyncPhase, user: GitUser },
    /// A clone or sync attempt checked out `commit`.
    SyncCompleted { commit: String, user: GitUser },
    /// A clone or sync attempt failed.
    SyncFailed { error: SyncError, user: GitUser },
}

/// One event in a sandbox's history.
///
/// `sequence` and `timestamp` are stamped by the event bus on publish:
/// sequence numbers are global and strictly increasing, timestamps are
/// strictly increasing per sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub sequence: u64,
    pub sandbox_id: SandboxId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl SandboxEvent {
    pub fn new(sandbox_id: SandboxId, kind: EventKind) -> Self {
        Self {
            sequence: 0,
            sandbox_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Shorthand for a phase change event.
    pub fn phase_changed(
        sandbox_id: SandboxId,
        from: SandboxPhase,
        to: SandboxPhase,
        detail: Option<String>,
    ) -> Self {
        Self::new(sandbox_id, EventKind::PhaseChanged { from, to, detail })
    }

    /// The phase entered, if this is a phase change.
    pub fn phase(&self) -> Option<SandboxPhase> {
        match self.kind {
            EventKind::PhaseChanged { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_is_only_reported_for_phase_changes() {
        let id = SandboxId::from("sbx");
        let change = SandboxEvent::phase_changed(
            id.clone(),
            SandboxPhase::Running,
            SandboxPhase::Stopping,
            None,
        );
        assert_eq!(change.phase(), Some(SandboxPhase::Stopping));

        let exec = SandboxEvent::new(
            id,
            EventKind::ExecCompleted {
                command: "true".into(),
                exit_code: 0,
            },
        );
        assert_eq!(exec.phase(), None);
    }

    #[test]
    fn event_kind_is_internally_tagged() {
        let kind = EventKind::BackendError {
            message: "timeout".into(),
            transient: true,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "backend_error");
        assert_eq!(json["transient"], true);
    }
}
