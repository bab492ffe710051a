//! Warden CLI entry point.
//!
//! `start` runs the reconciliation service, `run` executes one request and
//! prints its events as NDJSON, and `reconcile`, `status`, and `teardown`
//! manage containers by hand.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use warden::config::{runtime_paths, Config, RuntimePaths};
use warden::executor::events::ExecutionEvent;
use warden::executor::events::ExitState;
use warden::executor::router::ExecutionRouter;
use warden::executor::runtime;
use warden::session::{Session, SessionSource, SessionStore, SqliteSessionStore, Workspace};

/// Warden — sandboxed execution engine for a personal AI agent.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Reconcile at start and then periodically until interrupted.
    Start,
    /// Run one request and print its events as NDJSON on stdout.
    Run {
        /// Workspace slug; omit for the shared default scope.
        #[arg(long)]
        workspace: Option<String>,
        /// Trust designation (direct, sandboxed, or a legacy alias).
        #[arg(long)]
        trust: Option<String>,
        /// Session source: app, telegram, discord, or matrix.
        #[arg(long, default_value = "app")]
        source: String,
        /// Prior session to continue.
        #[arg(long)]
        resume: Option<String>,
        /// Message for the agent.
        message: String,
    },
    /// Run one reconciliation pass.
    Reconcile,
    /// Show runtime reachability and managed containers.
    Status,
    /// Remove a workspace container, or the default container.
    Teardown {
        /// Workspace slug; omit for the default container.
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await.map(|()| ExitCode::SUCCESS),
        Command::Run {
            workspace,
            trust,
            source,
            resume,
            message,
        } => handle_run(workspace, trust, &source, resume, &message).await,
        Command::Reconcile => handle_reconcile().await.map(|()| ExitCode::SUCCESS),
        Command::Status => handle_status().await.map(|()| ExitCode::SUCCESS),
        Command::Teardown { workspace } => {
            handle_teardown(workspace.as_deref()).await.map(|()| ExitCode::SUCCESS)
        }
    }
}

/// Configuration, paths, session store, and router.
struct Engine {
    config: Config,
    router: ExecutionRouter,
    sessions: Arc<dyn SessionStore>,
}

async fn build_engine() -> anyhow::Result<Engine> {
    let config = Config::load().context("failed to load configuration")?;
    let paths: RuntimePaths = runtime_paths(&config.paths)?;
    std::fs::create_dir_all(&paths.default_vault)
        .with_context(|| format!("failed to create {}", paths.default_vault.display()))?;

    let sessions: Arc<dyn SessionStore> = Arc::new(
        SqliteSessionStore::open(&paths.session_db)
            .await
            .with_context(|| format!("failed to open {}", paths.session_db.display()))?,
    );
    let runtime = runtime::from_settings(&config.sandbox).context("failed to configure container runtime")?;
    let router = ExecutionRouter::build(runtime, Arc::clone(&sessions), &config, paths.default_vault);

    Ok(Engine {
        config,
        router,
        sessions,
    })
}

/// Run the reconciliation service.
async fn handle_start() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let paths = runtime_paths(&config.paths)?;
    let _logging_guard = warden::logging::init_service(&paths.logs_dir)?;

    let engine = build_engine().await?;
    let orphaned = engine
        .sessions
        .mark_orphaned()
        .await
        .context("failed to close sessions from a previous run")?;
    if orphaned > 0 {
        warn!(orphaned, "closed session records whose owning process exited");
    }

    let lifecycle = Arc::clone(engine.router.lifecycle());
    lifecycle
        .runtime()
        .ping()
        .await
        .context("container runtime unreachable")?;

    let period = Duration::from_secs(engine.config.sandbox.reconcile_interval_secs.max(1));
    info!(
        backend = lifecycle.runtime().backend(),
        interval_secs = period.as_secs(),
        "warden service started"
    );

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = lifecycle.reconcile().await {
                    warn!(error = %e, "reconciliation pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }
    Ok(())
}

/// Execute one request, streaming NDJSON events to stdout.
async fn handle_run(
    workspace: Option<String>,
    trust: Option<String>,
    source: &str,
    resume: Option<String>,
    message: &str,
) -> anyhow::Result<ExitCode> {
    warden::logging::init_cli();
    let engine = build_engine().await?;

    let source: SessionSource = source.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let mut session = Session::new(Some(source));
    if let Some(slug) = workspace {
        let ws = engine
            .config
            .workspace(&slug)
            .unwrap_or_else(|| Workspace::new(slug.clone(), default_workspace_vault(&engine, &slug)));
        session = session.with_workspace(ws);
    }
    if let Some(trust) = trust {
        session = session.with_trust(trust);
    }
    if let Some(resume) = resume {
        session = session.with_resume(resume);
    }

    let mut stream = engine.router.run(&session, message)?;
    let mut stdout = std::io::stdout().lock();
    let mut status = ExitCode::FAILURE;
    while let Some(event) = stream.next().await {
        let line = serde_json::to_string(&event).context("failed to encode event")?;
        writeln!(stdout, "{line}").context("failed to write event")?;
        if let ExecutionEvent::Exit {
            status: ExitState::Ok,
            ..
        } = event
        {
            status = ExitCode::SUCCESS;
        }
    }
    stdout.flush().context("failed to flush stdout")?;
    Ok(status)
}

/// Vault for an undeclared workspace: `<default vault>/workspaces/<slug>`.
fn default_workspace_vault(engine: &Engine, slug: &str) -> PathBuf {
    engine
        .router
        .lifecycle()
        .mounts()
        .vault_root(None)
        .join("workspaces")
        .join(slug)
}

/// One reconciliation pass.
async fn handle_reconcile() -> anyhow::Result<()> {
    warden::logging::init_cli();
    let engine = build_engine().await?;
    let report = engine.router.lifecycle().reconcile().await?;

    println!(
        "kept {}, removed {}, skipped {}, failed {}",
        report.kept.len(),
        report.removed.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for name in &report.skipped {
        println!("  skipped {name} (active sessions)");
    }
    for (name, diagnostic) in &report.failed {
        println!("  failed {name}: {diagnostic}");
    }
    Ok(())
}

/// Print runtime reachability and managed containers.
async fn handle_status() -> anyhow::Result<()> {
    warden::logging::init_cli();
    let engine = build_engine().await?;
    let lifecycle = engine.router.lifecycle();

    match lifecycle.runtime().ping().await {
        Ok(()) => println!("runtime: {} (reachable)", lifecycle.runtime().backend()),
        Err(e) => {
            println!("runtime: {} (unreachable: {e})", lifecycle.runtime().backend());
            return Ok(());
        }
    }
    println!("config hash: {}", lifecycle.current_hash());

    let containers = lifecycle.status().await?;
    if containers.is_empty() {
        println!("no managed containers");
    }
    for c in containers {
        let active = engine.sessions.active_count(&c.name).await.unwrap_or_default();
        println!(
            "{}\t{}\t{}\t{:?}\tactive={active}",
            c.name,
            c.scope,
            if c.running { "running" } else { "stopped" },
            c.state
        );
    }
    Ok(())
}

/// Remove a workspace or default container.
async fn handle_teardown(workspace: Option<&str>) -> anyhow::Result<()> {
    warden::logging::init_cli();
    let engine = build_engine().await?;
    if let Some(slug) = workspace {
        warden::session::validate_slug(slug).map_err(|e| anyhow::anyhow!(e))?;
    }
    let state = engine.router.lifecycle().teardown(workspace).await?;
    println!(
        "{}: {state:?}",
        warden::executor::lifecycle::container_name(workspace)
    );
    Ok(())
}
