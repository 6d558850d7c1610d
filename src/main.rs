//! Open-Inspect sandbox CLI
//!
//! Provisions a local sandbox for a repository, runs one command in it and
//! prints the result together with the sandbox's event history.

use std::path::PathBuf;
use std::sync::Arc;

use inspect_sandbox::{Error, LocalBackend, ManagerConfig, SandboxManager, SessionConfig};

const USAGE: &str = "Usage: inspect-sandbox <repo> [ref] -- <command>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(split) = args.iter().position(|arg| arg == "--") else {
        print_usage();
        std::process::exit(2);
    };
    let (target, command) = (&args[..split], args[split + 1..].join(" "));
    if target.is_empty() || target.len() > 2 || command.is_empty() {
        print_usage();
        std::process::exit(2);
    }

    match run(&target[0], target.get(1).map(String::as_str), &command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("inspect-sandbox failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("{}", USAGE);
    eprintln!("\nEnvironment variables:");
    eprintln!("  INSPECT_SANDBOX_CONFIG=<path>  Manager config file (TOML)");
    eprintln!("  INSPECT_SANDBOX_DIR=<path>     Where sandbox directories are created");
    eprintln!("  INSPECT_SANDBOX_SYNC=0         Skip cloning the repository");
}

async fn run(repo: &str, git_ref: Option<&str>, command: &str) -> Result<i32, Error> {
    let config = match std::env::var("INSPECT_SANDBOX_CONFIG") {
        Ok(path) => ManagerConfig::from_file(path)?,
        Err(_) => ManagerConfig::default(),
    };
    let base_dir = std::env::var("INSPECT_SANDBOX_DIR").ok().map(PathBuf::from);
    let sync_git = std::env::var("INSPECT_SANDBOX_SYNC").map_or(true, |v| v != "0");

    let manager = SandboxManager::builder(Arc::new(LocalBackend::new(base_dir)))
        .config(config)
        .build()?;
    let watchdog = manager.spawn_watchdog();

    let mut session = SessionConfig::builder(repo).sync_git(false);
    if let Some(git_ref) = git_ref {
        session = session.git_ref(git_ref);
    }
    let handle = manager.provision(session.build()?).await?;
    tracing::info!(sandbox_id = %handle.id(), "sandbox ready");

    let result = async {
        if sync_git {
            let status = handle.resync(None).await?;
            tracing::info!(commit = ?status.last_commit, "repository checked out");
        }
        handle.exec(command).await
    }
    .await;

    let code = match &result {
        Ok(output) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            output.exit_code
        }
        Err(e) => {
            eprintln!("command failed: {}", e);
            1
        }
    };

    let id = handle.id().clone();
    manager.teardown(&id, "command finished").await?;

    println!("\n{}", "=".repeat(60));
    println!("Events for sandbox {}", id);
    println!("{}", "=".repeat(60));
    for event in manager.subscribe_history(Some(&id)) {
        println!(
            "#{:<4} {}  {}",
            event.sequence,
            event.timestamp.format("%H:%M:%S%.3f"),
            serde_json::to_string(&event.kind).unwrap_or_default()
        );
    }

    manager.shutdown().await?;
    let _ = watchdog.await;
    Ok(code)
}
