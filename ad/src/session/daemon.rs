//! Session daemon: a detached background process hosting one loop run
//!
//! The parent writes the daemon config and session meta, forks a detached
//! child (`adaf session-daemon --session <id>`, own session id via setsid,
//! stdio on `daemon.log`), and waits for the meta to report `running`.
//! The child body [`run_session`] is also used directly for foreground
//! runs, inline spawn children, and tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result, bail, eyre};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use adafstore::{SessionMeta, SessionStatus, SessionStore, SignalKind, Store, fsutil};

use super::fanout::EventHub;
use super::protocol::{ClientMessage, ServerMessage, read_frame, write_frame};
use crate::agent::AgentRegistry;
use crate::config::Config;
use crate::debug_log::DebugLog;
use crate::orchestrator::{LaunchMode, Orchestrator};
use crate::r#loop::{DelegationTree, LoopDefinition, LoopRuntime};

/// How long the parent waits for the forked child to reach `running`
pub const START_TIMEOUT: Duration = Duration::from_secs(8);

/// Default timeout for blocking spawn RPCs
const SPAWN_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything a daemon child needs to reconstruct its world
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Repository owning the `.adaf` store
    pub project_dir: PathBuf,
    /// Where agent processes run (the repo root, or a spawn's worktree)
    pub work_dir: PathBuf,
    pub definition: LoopDefinition,
    /// Snapshot of profiles, agent overrides, and limits at session creation
    pub snapshot: Config,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub parent_turn: Option<u64>,
}

/// Allocate a session, persist its meta (status `starting`) and config
pub fn create_session(sessions: &SessionStore, cfg: &DaemonConfig) -> Result<u64> {
    let id = sessions.allocate_id().context("allocating session id")?;
    let project_name = cfg
        .project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let profile = cfg.definition.steps.first().map(|s| s.profile.clone());
    let agent = profile
        .as_deref()
        .and_then(|p| cfg.snapshot.profile(p))
        .map(|p| p.agent.clone());

    sessions
        .create_session(SessionMeta {
            id,
            pid: std::process::id(),
            status: SessionStatus::Starting,
            project_path: cfg.project_dir.display().to_string(),
            project_name,
            profile,
            agent,
            loop_name: Some(cfg.definition.name.clone()),
            loop_run: None,
            steps: cfg.definition.step_metas(),
            error: None,
            started_at: 0,
            ended_at: None,
        })
        .context("creating session meta")?;

    fsutil::write_json_atomic(&sessions.session_dir(id).join("daemon.json"), cfg)
        .context("writing daemon config")?;
    debug!(id, "create_session: session prepared");
    Ok(id)
}

/// Read back a session's daemon config
pub fn read_daemon_config(sessions: &SessionStore, id: u64) -> Result<DaemonConfig> {
    fsutil::read_json(&sessions.session_dir(id).join("daemon.json"), "daemon config")
        .map_err(|e| eyre!("reading daemon config for session {}: {}", id, e))
}

/// Fork the daemon child and wait until it reports `running`
pub async fn start_detached(sessions: &SessionStore, id: u64) -> Result<()> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(sessions.log_path(id))
        .context("opening daemon.log")?;
    let log_err = log.try_clone().context("cloning daemon.log handle")?;

    let mut command = tokio::process::Command::new(exe);
    command
        .arg("session-daemon")
        .arg("--session")
        .arg(id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    // Detach into its own session so terminal signals never reach it
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = command.spawn().context("forking session daemon")?;
    if let Some(pid) = child.id() {
        sessions.update_meta(id, |m| m.pid = pid)?;
    }
    // Reap the child in the background; the daemon outlives this handle
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        let meta = sessions.meta(id)?;
        match meta.status {
            SessionStatus::Running => {
                info!(id, pid = meta.pid, "session daemon running");
                return Ok(());
            }
            SessionStatus::Starting => {}
            status => bail!(
                "session {} daemon failed during startup (status {}{})",
                id,
                status,
                meta.error.map(|e| format!(": {}", e)).unwrap_or_default()
            ),
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("session {} daemon did not start within {:?}", id, START_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// The daemon child body: control socket, loop runtime, event fan-out
///
/// Returns once the run reached a terminal state; the final status has been
/// written to the session meta and the `done` event journaled.
pub async fn run_session(
    sessions: SessionStore,
    id: u64,
    cancel: CancellationToken,
    launch: LaunchMode,
    mirror: bool,
) -> Result<()> {
    let cfg = read_daemon_config(&sessions, id)?;
    info!(id, loop_name = %cfg.definition.name, project = %cfg.project_dir.display(), "run_session: starting");
    let debug_log = DebugLog::for_process(&format!("session-{}", id), sessions.root());
    debug_log.log(&format!(
        "loop {} starting in {}",
        cfg.definition.name,
        cfg.work_dir.display()
    ));

    let store = Store::open_project(&cfg.project_dir).context("opening project store")?;
    sessions.update_meta(id, |m| m.pid = std::process::id())?;

    let hub = Arc::new(EventHub::open(sessions.events_path(id)).context("opening event journal")?);

    let socket_path = sessions.socket_path(id);
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("removing stale control socket")?;
    }
    let listener = UnixListener::bind(&socket_path).context("binding control socket")?;

    let config = Arc::new(cfg.snapshot.clone());
    let registry = Arc::new(AgentRegistry::standard());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let runtime = LoopRuntime::create(
        store.clone(),
        config.clone(),
        registry,
        cfg.definition.clone(),
        cfg.work_dir.clone(),
        events_tx,
        cancel.clone(),
    )?
    .with_session(id)
    .with_plan(cfg.plan.clone())
    .with_parent_turn(cfg.parent_turn)
    .with_mirror(mirror);
    let run_id = runtime.run_id();
    let run_hex = runtime.run_hex().to_string();

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        config.clone(),
        sessions.clone(),
        cfg.project_dir.clone(),
        launch,
    ));

    sessions.update_meta(id, |m| {
        m.status = SessionStatus::Running;
        m.loop_run = Some(run_id);
    })?;

    // Journal + fan out every runtime event
    let pump = {
        let hub = hub.clone();
        tokio::spawn(async move {
            while let Some(message) = events_rx.recv().await {
                hub.publish(&message);
            }
        })
    };

    // Serve control connections for the lifetime of the run
    let accept = {
        let hub = hub.clone();
        let cancel = cancel.clone();
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        let definition = cfg.definition.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed; control socket closing");
                        break;
                    }
                };
                let hub = hub.clone();
                let cancel = cancel.clone();
                let orchestrator = orchestrator.clone();
                let store = store.clone();
                let definition = definition.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub, cancel, orchestrator, store, definition).await {
                        debug!(error = %e, "control connection ended with error");
                    }
                });
            }
        })
    };

    let outcome = runtime.run().await;

    // Drain the runtime's events before journaling the terminal one
    let _ = pump.await;

    let (status, error) = match &outcome {
        Ok(o) => match o.status {
            adafstore::LoopRunStatus::Cancelled => (SessionStatus::Cancelled, None),
            _ if o.error.is_some() => (SessionStatus::Error, o.error.clone()),
            _ => (SessionStatus::Done, None),
        },
        Err(e) => (SessionStatus::Error, Some(format!("{:#}", e))),
    };

    hub.publish(&ServerMessage::Done { error: error.clone() });
    hub.flush();
    hub.detach_all();

    sessions.update_meta(id, |m| {
        m.status = status;
        m.error = error;
    })?;

    accept.abort();
    let _ = std::fs::remove_file(&socket_path);
    let _ = store.clear_signal(SignalKind::Stop, &run_hex);

    debug_log.log(&format!("loop {} finished: {}", cfg.definition.name, status));
    info!(id, %status, "run_session: finished");
    outcome.map(|_| ())
}

/// Serve one control-socket connection
async fn handle_connection(
    mut stream: UnixStream,
    hub: Arc<EventHub>,
    cancel: CancellationToken,
    orchestrator: Arc<Orchestrator>,
    store: Store,
    definition: LoopDefinition,
) -> Result<()> {
    loop {
        let message: Option<ClientMessage> = read_frame(&mut stream).await?;
        let Some(message) = message else {
            return Ok(());
        };
        debug!(?message, "handle_connection: request");

        match message {
            ClientMessage::Attach { replay_from } => {
                // An attached connection becomes a pure event stream; the
                // client opens a second connection for further control
                let (replay, mut live) = hub.attach(replay_from.unwrap_or(0))?;
                for line in replay {
                    forward_line(&mut stream, &line).await?;
                }
                while let Some(line) = live.recv().await {
                    forward_line(&mut stream, &line).await?;
                }
                return Ok(());
            }
            ClientMessage::Cancel {} => {
                info!("cancel requested over control socket");
                cancel.cancel();
                write_frame(&mut stream, &ServerMessage::Ok {}).await?;
            }
            ClientMessage::Ping {} => {
                write_frame(&mut stream, &ServerMessage::Pong {}).await?;
            }
            ClientMessage::Wait { turn_id } => {
                let reply = match store.raise_signal(SignalKind::Wait, &turn_id.to_string(), None) {
                    Ok(()) => ServerMessage::Ok {},
                    Err(e) if e.is_conflict() => ServerMessage::Ok {},
                    Err(e) => ServerMessage::Error { message: e.to_string() },
                };
                write_frame(&mut stream, &reply).await?;
            }
            ClientMessage::Spawn { request } => {
                let delegation = resolve_delegation(&store, &definition, request.parent_turn);
                let wait = request.wait;
                let reply = match orchestrator.spawn(request, delegation.as_ref()).await {
                    Ok(spawn) => {
                        if wait {
                            match orchestrator.wait_spawn(spawn.id, SPAWN_WAIT_TIMEOUT).await {
                                Ok(settled) => ServerMessage::SpawnResult {
                                    ok: true,
                                    spawn_id: Some(settled.id),
                                    status: Some(settled.status.to_string()),
                                    exit_code: settled.exit_code,
                                    result: settled.result,
                                    error: None,
                                },
                                Err(e) => ServerMessage::SpawnResult {
                                    ok: false,
                                    spawn_id: Some(spawn.id),
                                    status: None,
                                    exit_code: None,
                                    result: None,
                                    error: Some(e.to_string()),
                                },
                            }
                        } else {
                            ServerMessage::SpawnResult {
                                ok: true,
                                spawn_id: Some(spawn.id),
                                status: Some(spawn.status.to_string()),
                                exit_code: None,
                                result: None,
                                error: None,
                            }
                        }
                    }
                    Err(e) => ServerMessage::SpawnResult {
                        ok: false,
                        spawn_id: None,
                        status: None,
                        exit_code: None,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                write_frame(&mut stream, &reply).await?;
            }
        }
    }
}

/// Re-send a journal line as a wire frame
async fn forward_line(stream: &mut UnixStream, line: &str) -> Result<()> {
    let message: ServerMessage = serde_json::from_str(line).context("parsing journal line")?;
    write_frame(stream, &message).await?;
    Ok(())
}

/// The delegation tree of the step a turn belongs to
fn resolve_delegation(store: &Store, definition: &LoopDefinition, parent_turn: u64) -> Option<DelegationTree> {
    let turn = store.turn(parent_turn).ok()?;
    let step_hex = turn.step_hex?;
    let run = store.loop_run_by_hex(&turn.loop_run_hex?).ok()?;
    let key = run.step_keys.iter().find(|(_, hex)| **hex == step_hex)?.0;
    let idx: usize = key.split(':').nth(1)?.parse().ok()?;
    definition.steps.get(idx)?.delegation.clone()
}
