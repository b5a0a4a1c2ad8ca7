//! ADAF CLI entry point
//!
//! Dispatches user commands, the hidden daemon re-exec entry, and the
//! agent-view RPC subset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, bail, eyre};
use tracing::{debug, info};

use adaf::cli::{AgentContext, Cli, Command, in_agent_context};
use adaf::config::Config;
use adaf::orchestrator::{LaunchMode, Orchestrator};
use adaf::r#loop::LoopDefinition;
use adaf::session::daemon::{self, DaemonConfig};
use adaf::session::protocol::{ServerMessage, SpawnRequest};
use adaf::session::client::SessionClient;
use adafstore::{SessionStatus, SessionStore, SignalKind, Store};
use std::sync::Arc;

/// Global root: `$ADAF_HOME` override, else `$HOME/.adaf`
fn global_root() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("ADAF_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|h| h.join(".adaf"))
        .ok_or_else(|| eyre!("cannot resolve home directory"))
}

/// Route tracing to a file under `<root>/debug/`, or stderr for daemons
fn setup_logging(level: Option<&str>, root: &Path, to_stderr: bool) -> Result<()> {
    let level = match level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("ADAF_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::default().add_directive(level.into()));

    if to_stderr {
        // Daemon children already have stderr wired to daemon.log
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
        return Ok(());
    }

    let log_dir = root.join("debug");
    std::fs::create_dir_all(&log_dir).context("creating log directory")?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("adaf-{}.log", chrono::Utc::now().format("%Y-%m-%d"))))
        .context("opening log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let root = global_root()?;
    let to_stderr = matches!(cli.command, Command::SessionDaemon { .. });
    setup_logging(cli.log_level.as_deref(), &root, to_stderr)?;

    // The agent view sees only the RPC subset, and vice versa
    if in_agent_context() && !cli.command.allowed_in_agent_view() {
        bail!("not available inside an agent context");
    }
    if !in_agent_context() && cli.command.requires_agent_view() {
        bail!("only available inside an agent context (ADAF_AGENT=1)");
    }

    let config = Config::load(cli.config.as_ref(), &root)?;
    debug!(?cli.command, "dispatching command");

    match cli.command {
        Command::Init => cmd_init(),
        Command::Run {
            target,
            task,
            max_cycles,
            plan,
            foreground,
        } => cmd_run(&root, config, &target, task, max_cycles, plan, foreground).await,
        Command::Attach { session, replay_from } => cmd_attach(&root, session, replay_from).await,
        Command::Stop { session } => cmd_stop(&root, session).await,
        Command::Sessions => cmd_sessions(&root),
        Command::SessionDaemon { session } => cmd_session_daemon(&root, session).await,
        Command::Merge { spawn, squash } => cmd_merge(&root, config, spawn, squash).await,
        Command::Reject { spawn } => cmd_reject(&root, config, spawn).await,
        Command::Diff { spawn } => cmd_diff(&root, config, spawn).await,
        Command::SpawnReply { spawn, answer } => cmd_spawn_reply(&root, config, spawn, &answer),
        Command::Spawn {
            profile,
            task,
            read_only,
            issue,
            wait,
        } => cmd_agent_spawn(&root, &profile, &task, read_only, issue, wait).await,
        Command::WaitForSpawns => cmd_wait_for_spawns(&root).await,
        Command::LoopMessage { content } => cmd_loop_message(&root, &content),
        Command::ParentAsk { question, timeout } => cmd_parent_ask(&root, config, &question, timeout).await,
        Command::LoopStop => cmd_loop_stop(),
    }
}

fn cmd_init() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let store = Store::open_project(&cwd)?;
    let name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    store.init_project(&name, &cwd.display().to_string())?;
    println!("Initialised ADAF store at {}", store.root().display());
    Ok(())
}

/// Resolve the run target: a configured loop, or a profile for a one-shot ask
fn resolve_definition(config: &Config, target: &str, task: Option<&str>, max_cycles: Option<u64>) -> Result<LoopDefinition> {
    let mut def = if let Some(def) = config.loop_def(target) {
        def.clone()
    } else if config.profile(target).is_some() {
        let task = task.ok_or_else(|| eyre!("--task is required when running a profile directly"))?;
        LoopDefinition::single_step("ask", target, task)
    } else {
        bail!("no loop or profile named {} in config", target);
    };
    if let Some(cap) = max_cycles {
        def.max_cycles = cap;
    }
    Ok(def)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    root: &Path,
    config: Config,
    target: &str,
    task: Option<String>,
    max_cycles: Option<u64>,
    plan: Option<String>,
    foreground: bool,
) -> Result<()> {
    let cwd = std::env::current_dir()?;
    Store::open_project(&cwd)?;
    let sessions = SessionStore::open(root)?;

    let definition = resolve_definition(&config, target, task.as_deref(), max_cycles)?;
    let daemon_config = DaemonConfig {
        project_dir: cwd.clone(),
        work_dir: cwd,
        definition,
        snapshot: config,
        plan,
        parent_turn: None,
    };
    let id = daemon::create_session(&sessions, &daemon_config)?;

    if foreground {
        info!(id, "running session in the foreground");
        let cancel = tokio_util::sync::CancellationToken::new();
        spawn_signal_canceller(cancel.clone());
        daemon::run_session(sessions.clone(), id, cancel, LaunchMode::Detached, true).await?;
        let meta = sessions.meta(id)?;
        report_final(&meta.status, meta.error.as_deref())
    } else {
        daemon::start_detached(&sessions, id).await?;
        println!("Session {} started (attach with: adaf attach {})", id, id);
        Ok(())
    }
}

async fn cmd_attach(root: &Path, session: u64, replay_from: Option<u64>) -> Result<()> {
    let sessions = SessionStore::open(root)?;
    let meta = sessions.meta(session)?;
    if meta.status.is_terminal() {
        bail!("session {} is already {}", session, meta.status);
    }

    let client = SessionClient::new(sessions, session);
    let mut stream = client.attach(replay_from).await?;

    use std::io::Write;
    while let Some(message) = stream.next().await {
        match message {
            ServerMessage::Raw { data } => {
                print!("{}", data);
                let _ = std::io::stdout().flush();
            }
            ServerMessage::Finished { exit_code, .. } => {
                debug!(exit_code, "turn finished");
            }
            ServerMessage::Done { error } => {
                return report_final(&SessionStatus::Done, error.as_deref());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn cmd_stop(root: &Path, session: u64) -> Result<()> {
    let sessions = SessionStore::open(root)?;
    let client = SessionClient::new(sessions, session);
    let status = client.stop().await?;
    println!("Session {} stopped ({})", session, status);
    Ok(())
}

fn cmd_sessions(root: &Path) -> Result<()> {
    let sessions = SessionStore::open(root)?;
    let metas = sessions.list()?;
    if metas.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    println!("{:<6} {:<10} {:<8} {:<16} PROJECT", "ID", "STATUS", "PID", "LOOP");
    for meta in metas {
        println!(
            "{:<6} {:<10} {:<8} {:<16} {}",
            meta.id,
            meta.status.to_string(),
            meta.pid,
            meta.loop_name.as_deref().unwrap_or("-"),
            meta.project_name,
        );
    }
    Ok(())
}

async fn cmd_session_daemon(root: &Path, session: u64) -> Result<()> {
    let sessions = SessionStore::open(root)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    spawn_signal_canceller(cancel.clone());
    daemon::run_session(sessions, session, cancel, LaunchMode::Detached, false).await
}

/// Cancel the token on SIGTERM or SIGINT
fn spawn_signal_canceller(cancel: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind as Sig, signal};
        let mut sigterm = match signal(Sig::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigint = match signal(Sig::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("termination signal received; cancelling run");
        cancel.cancel();
    });
}

fn report_final(status: &SessionStatus, error: Option<&str>) -> Result<()> {
    match error {
        Some(error) => bail!("session ended with error: {}", error),
        None => {
            println!("Session finished ({})", status);
            Ok(())
        }
    }
}

fn user_orchestrator(root: &Path, config: Config) -> Result<(Store, Orchestrator)> {
    let cwd = std::env::current_dir()?;
    let store = Store::open_project(&cwd)?;
    let sessions = SessionStore::open(root)?;
    let orchestrator = Orchestrator::new(store.clone(), Arc::new(config), sessions, cwd, LaunchMode::Detached);
    Ok((store, orchestrator))
}

async fn cmd_merge(root: &Path, config: Config, spawn: u64, squash: bool) -> Result<()> {
    let (_store, orchestrator) = user_orchestrator(root, config)?;
    let merged = orchestrator.merge(spawn, squash).await?;
    println!(
        "Spawn {} merged ({})",
        spawn,
        merged.merge_commit.as_deref().unwrap_or("no commit")
    );
    Ok(())
}

async fn cmd_reject(root: &Path, config: Config, spawn: u64) -> Result<()> {
    let (_store, orchestrator) = user_orchestrator(root, config)?;
    orchestrator.reject(spawn).await?;
    println!("Spawn {} rejected", spawn);
    Ok(())
}

async fn cmd_diff(root: &Path, config: Config, spawn: u64) -> Result<()> {
    let (_store, orchestrator) = user_orchestrator(root, config)?;
    print!("{}", orchestrator.diff(spawn).await?);
    Ok(())
}

fn cmd_spawn_reply(root: &Path, config: Config, spawn: u64, answer: &str) -> Result<()> {
    let (_store, orchestrator) = user_orchestrator(root, config)?;
    orchestrator.reply(spawn, answer)?;
    println!("Reply posted to spawn {}", spawn);
    Ok(())
}

// === agent-view commands: RPCs back into the hosting daemon ===

async fn cmd_agent_spawn(
    root: &Path,
    profile: &str,
    task: &str,
    read_only: bool,
    issues: Vec<u64>,
    wait: bool,
) -> Result<()> {
    let ctx = AgentContext::from_env()?;
    let sessions = SessionStore::open(root)?;
    let client = SessionClient::new(sessions, ctx.session_id);

    let reply = client
        .spawn(SpawnRequest {
            parent_turn: ctx.turn_id,
            parent_profile: ctx.profile.clone(),
            child_profile: profile.to_string(),
            role: None,
            position: None,
            task: task.to_string(),
            issues,
            read_only,
            wait,
        })
        .await?;

    match reply {
        ServerMessage::SpawnResult {
            ok: true,
            spawn_id,
            status,
            exit_code,
            result,
            ..
        } => {
            let spawn_id = spawn_id.unwrap_or(0);
            match status {
                Some(status) if wait => {
                    println!(
                        "spawn {} {}{}",
                        spawn_id,
                        status,
                        exit_code.map(|c| format!(" (exit {})", c)).unwrap_or_default()
                    );
                    if let Some(result) = result {
                        println!("{}", result);
                    }
                }
                _ => println!("spawn {} running", spawn_id),
            }
            Ok(())
        }
        ServerMessage::SpawnResult { error, .. } => bail!("spawn failed: {}", error.unwrap_or_default()),
        other => bail!("unexpected reply: {:?}", other),
    }
}

async fn cmd_wait_for_spawns(root: &Path) -> Result<()> {
    let ctx = AgentContext::from_env()?;
    let sessions = SessionStore::open(root)?;
    let client = SessionClient::new(sessions, ctx.session_id);
    client.wait(ctx.turn_id).await?;
    println!("wait recorded; this step suspends after the current turn");
    Ok(())
}

fn cmd_loop_message(root: &Path, content: &str) -> Result<()> {
    let ctx = AgentContext::from_env()?;
    let run_hex = ctx
        .loop_run_hex
        .as_deref()
        .ok_or_else(|| eyre!("not running inside a loop"))?;
    let step_index = ctx.step_index.ok_or_else(|| eyre!("missing step index"))?;

    // The step's capability flag comes from the hosting session's config
    let sessions = SessionStore::open(root)?;
    let daemon_config = daemon::read_daemon_config(&sessions, ctx.session_id)?;
    let step = daemon_config
        .definition
        .steps
        .get(step_index)
        .ok_or_else(|| eyre!("step {} not in loop definition", step_index))?;
    if !step.can_message {
        bail!("this step may not post loop messages");
    }

    let store = Store::open_project(&ctx.project_dir)?;
    let run = store.loop_run_by_hex(run_hex)?;
    let message = store.post_loop_message(run.id, step_index, content)?;
    println!("message {} posted", message.id);
    Ok(())
}

async fn cmd_parent_ask(root: &Path, config: Config, question: &str, timeout: u64) -> Result<()> {
    let ctx = AgentContext::from_env()?;
    let store = Store::open_project(&ctx.project_dir)?;
    let sessions = SessionStore::open(root)?;

    // This agent is the child of exactly one spawn: the one owning its session
    let spawn = store
        .list_spawns()?
        .into_iter()
        .find(|s| s.child_session == Some(ctx.session_id))
        .ok_or_else(|| eyre!("no spawn record owns session {}", ctx.session_id))?;

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(config),
        sessions,
        ctx.project_dir.clone(),
        LaunchMode::Detached,
    );
    let reply = orchestrator
        .ask_parent(spawn.id, question, Duration::from_secs(timeout))
        .await?;
    println!("{}", reply.content);
    Ok(())
}

fn cmd_loop_stop() -> Result<()> {
    let ctx = AgentContext::from_env()?;
    if ctx.position != adaf::r#loop::SUPERVISOR_POSITION {
        bail!("loop-stop is restricted to the supervisor position");
    }
    let run_hex = ctx
        .loop_run_hex
        .as_deref()
        .ok_or_else(|| eyre!("not running inside a loop"))?;

    let store = Store::open_project(&ctx.project_dir)?;
    match store.raise_signal(SignalKind::Stop, run_hex, None) {
        Ok(()) => {
            println!("stop signal raised for run {}", run_hex);
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("stop signal already pending for run {}", run_hex);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
