//! Manager tests against the directory-based local backend.

use std::sync::Arc;

use tempfile::TempDir;

use inspect_sandbox::{
    GitUser, LocalBackend, ManagerConfig, SandboxManager, SandboxPhase, SessionConfig,
};

fn manager(dir: &TempDir) -> (SandboxManager, Arc<LocalBackend>) {
    let backend = Arc::new(LocalBackend::new(Some(dir.path().to_path_buf())));
    let manager = SandboxManager::builder(backend.clone())
        .config(ManagerConfig::default())
        .default_git_user(GitUser::new("Test User", "test@test.com"))
        .build()
        .expect("failed to build manager");
    (manager, backend)
}

#[tokio::test]
async fn local_sandbox_runs_commands_with_session_env() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let (manager, backend) = manager(&dir);
    let config = SessionConfig::builder("octo/widgets")
        .env("GREETING", "hello from the sandbox")
        .sync_git(false)
        .build()
        .expect("invalid session config");

    let handle = manager.provision(config).await.expect("provision failed");
    assert_eq!(handle.status().phase, SandboxPhase::Running);
    let path = backend
        .path_of(handle.backend_ref())
        .expect("sandbox directory not tracked");
    assert!(path.starts_with(dir.path()));

    let output = handle.exec("echo \"$GREETING\"").await.expect("exec failed");
    assert_eq!(output.stdout_trimmed(), "hello from the sandbox");

    let output = handle.exec("touch marker && ls").await.expect("exec failed");
    assert_eq!(output.stdout_trimmed(), "marker");
    assert!(path.join("marker").exists());

    let output = handle.exec("exit 3").await.expect("exec failed");
    assert_eq!(output.exit_code, 3);

    manager
        .teardown(handle.id(), "test finished")
        .await
        .expect("teardown failed");
    assert_eq!(handle.status().phase, SandboxPhase::Stopped);
    assert!(!path.exists());

    manager.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn removed_directory_is_observed_as_exit() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let (manager, backend) = manager(&dir);
    let config = SessionConfig::builder("octo/widgets")
        .sync_git(false)
        .build()
        .expect("invalid session config");

    let handle = manager.provision(config).await.expect("provision failed");
    let path = backend
        .path_of(handle.backend_ref())
        .expect("sandbox directory not tracked");
    std::fs::remove_dir_all(&path).expect("failed to remove sandbox dir");

    let status = handle.refresh_status().await.expect("refresh failed");
    assert_eq!(status.phase, SandboxPhase::Stopped);

    manager.shutdown().await.expect("shutdown failed");
}
