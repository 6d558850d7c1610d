//! Sandbox lifecycle phases and the status record the manager maintains.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a sandbox.
///
/// Phases only move forward along
/// `Pending -> Provisioning -> Running -> Stopping -> Stopped`. `Failed`
/// can be entered from `Provisioning`, `Running` or `Stopping`. `Stopped`
/// and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPhase {
    Pending,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxPhase {
    /// Returns true for `Stopped` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxPhase::Stopped | SandboxPhase::Failed)
    }

    /// The next phase along the clean path, if any.
    pub fn successor(self) -> Option<SandboxPhase> {
        match self {
            SandboxPhase::Pending => Some(SandboxPhase::Provisioning),
            SandboxPhase::Provisioning => Some(SandboxPhase::Running),
            SandboxPhase::Running => Some(SandboxPhase::Stopping),
            SandboxPhase::Stopping => Some(SandboxPhase::Stopped),
            SandboxPhase::Stopped | SandboxPhase::Failed => None,
        }
    }

    /// Returns true if `next` is a legal single-step transition.
    pub fn can_transition_to(self, next: SandboxPhase) -> bool {
        if next == SandboxPhase::Failed {
            return matches!(
                self,
                SandboxPhase::Provisioning | SandboxPhase::Running | SandboxPhase::Stopping
            );
        }
        self.successor() == Some(next)
    }

    /// Phases to walk through, in order, to get from `self` to `target`
    /// along the clean path. Returns `None` if `target` is not ahead of
    /// `self` on that path.
    pub fn path_to(self, target: SandboxPhase) -> Option<Vec<SandboxPhase>> {
        if target == SandboxPhase::Failed {
            return self.can_transition_to(target).then(|| vec![target]);
        }
        let mut path = Vec::new();
        let mut current = self;
        while let Some(next) = current.successor() {
            path.push(next);
            if next == target {
                return Some(path);
            }
            current = next;
        }
        None
    }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxPhase::Pending => "pending",
            SandboxPhase::Provisioning => "provisioning",
            SandboxPhase::Running => "running",
            SandboxPhase::Stopping => "stopping",
            SandboxPhase::Stopped => "stopped",
            SandboxPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Overall lifecycle state of one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub phase: SandboxPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the sandbox first reached `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the sandbox reached a terminal phase.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit or error detail attached to the latest transition.
    pub detail: Option<String>,
}

impl SandboxStatus {
    /// A fresh `Pending` status.
    pub fn pending() -> Self {
        let now = Utc::now();
        Self {
            phase: SandboxPhase::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Applies a single-step transition.
    ///
    /// Returns the previous phase, or `None` (leaving the status untouched)
    /// when the transition is illegal.
    pub fn transition(&mut self, next: SandboxPhase, detail: Option<String>) -> Option<SandboxPhase> {
        if !self.phase.can_transition_to(next) {
            return None;
        }
        let previous = self.phase;
        let now = Utc::now();
        self.phase = next;
        self.updated_at = now;
        if next == SandboxPhase::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        if detail.is_some() {
            self.detail = detail;
        }
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_transitions_are_allowed() {
        assert!(SandboxPhase::Pending.can_transition_to(SandboxPhase::Provisioning));
        assert!(SandboxPhase::Provisioning.can_transition_to(SandboxPhase::Running));
        assert!(SandboxPhase::Running.can_transition_to(SandboxPhase::Stopping));
        assert!(SandboxPhase::Stopping.can_transition_to(SandboxPhase::Stopped));
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        assert!(!SandboxPhase::Provisioning.can_transition_to(SandboxPhase::Stopping));
        assert!(!SandboxPhase::Running.can_transition_to(SandboxPhase::Stopped));
        assert!(!SandboxPhase::Running.can_transition_to(SandboxPhase::Provisioning));
    }

    #[test]
    fn failed_is_reachable_once_provisioning_started() {
        assert!(!SandboxPhase::Pending.can_transition_to(SandboxPhase::Failed));
        assert_eq!(SandboxPhase::Pending.path_to(SandboxPhase::Failed), None);
        for phase in [
            SandboxPhase::Provisioning,
            SandboxPhase::Running,
            SandboxPhase::Stopping,
        ] {
            assert!(phase.can_transition_to(SandboxPhase::Failed), "{phase}");
        }
    }

    #[test]
    fn terminal_phases_do_not_move() {
        for terminal in [SandboxPhase::Stopped, SandboxPhase::Failed] {
            assert!(!terminal.can_transition_to(SandboxPhase::Failed));
            assert!(!terminal.can_transition_to(SandboxPhase::Stopping));
        }
    }

    #[test]
    fn path_to_walks_intermediate_phases() {
        assert_eq!(
            SandboxPhase::Running.path_to(SandboxPhase::Stopped),
            Some(vec![SandboxPhase::Stopping, SandboxPhase::Stopped])
        );
        assert_eq!(
            SandboxPhase::Stopping.path_to(SandboxPhase::Failed),
            Some(vec![SandboxPhase::Failed])
        );
        assert_eq!(SandboxPhase::Stopping.path_to(SandboxPhase::Running), None);
        assert_eq!(SandboxPhase::Stopped.path_to(SandboxPhase::Failed), None);
    }

    #[test]
    fn transition_records_timestamps_and_detail() {
        let mut status = SandboxStatus::pending();
        assert_eq!(
            status.transition(SandboxPhase::Provisioning, None),
            Some(SandboxPhase::Pending)
        );
        status.transition(SandboxPhase::Running, None);
        assert!(status.started_at.is_some());

        status.transition(SandboxPhase::Failed, Some("backend lost".into()));
        assert!(status.is_terminal());
        assert!(status.finished_at.is_some());
        assert_eq!(status.detail.as_deref(), Some("backend lost"));
    }

    #[test]
    fn illegal_transition_leaves_status_untouched() {
        let mut status = SandboxStatus::pending();
        let before = status.clone();
        assert_eq!(status.transition(SandboxPhase::Stopped, None), None);
        assert_eq!(status, before);
    }

    #[test]
    fn phase_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&SandboxPhase::Provisioning).unwrap(),
            "\"provisioning\""
        );
    }
}
