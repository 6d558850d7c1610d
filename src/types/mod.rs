//! Data model shared by the orchestrator and code running inside a sandbox.
//!
//! Nothing in this module depends on the orchestration stack, so it is
//! always compiled, including with `--no-default-features`.

mod event;
mod git;
mod session;
mod status;

pub use event::{EventKind, SandboxEvent};
pub use git::{GitSyncPhase, GitSyncStatus, GitUser};
pub use session::{ProvisionKey, ResourceLimits, SessionConfig, SessionConfigBuilder};
pub use status::{SandboxPhase, SandboxStatus};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique, never-reused identifier of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Allocates a fresh random id.
    #[cfg(feature = "orchestrator")]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SandboxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
