//! Open-Inspect sandbox manager
//!
//! Provisions ephemeral sandboxes for agent sessions, tracks each one
//! through its lifecycle, keeps its git working tree in sync, and publishes
//! every lifecycle and sync change as an ordered event stream.
//!
//! The data model in [`types`] builds without the orchestration stack
//! (`--no-default-features`) so code running inside a sandbox can report
//! status and events in the same shapes the orchestrator uses.

pub mod error;
pub mod types;
pub mod validate;

#[cfg(feature = "orchestrator")]
pub mod backend;
#[cfg(feature = "orchestrator")]
pub mod backoff;
#[cfg(feature = "orchestrator")]
pub mod cancel;
#[cfg(feature = "orchestrator")]
pub mod config;
#[cfg(feature = "orchestrator")]
pub mod events;
#[cfg(feature = "orchestrator")]
mod git_sync;
#[cfg(feature = "orchestrator")]
pub mod handle;
#[cfg(feature = "orchestrator")]
pub mod manager;

pub use error::{Error, Result, SyncError, SyncErrorKind};
pub use types::{
    EventKind, GitSyncPhase, GitSyncStatus, GitUser, ProvisionKey, ResourceLimits, SandboxEvent,
    SandboxId, SandboxPhase, SandboxStatus, SessionConfig, SessionConfigBuilder,
};
pub use validate::{Validate, ValidationResult};

#[cfg(feature = "orchestrator")]
pub use backend::{
    BackendError, BackendRef, BackendState, ExecGitBackend, ExecOutput, GitBackend, LocalBackend,
    SandboxBackend,
};
#[cfg(feature = "orchestrator")]
pub use cancel::CancelToken;
#[cfg(feature = "orchestrator")]
pub use config::{ManagerConfig, ProvisionPolicy};
#[cfg(feature = "orchestrator")]
pub use events::{EventBus, LiveEvents};
#[cfg(feature = "orchestrator")]
pub use handle::SandboxHandle;
#[cfg(feature = "orchestrator")]
pub use manager::{ListFilter, SandboxManager, SandboxManagerBuilder, SweepReport};
