//! Subprocess runner for agent invocations
//!
//! Launches the agent in its own process group, feeds the prompt on stdin,
//! tees both output pipes into the recorder (and an optional live tap), and
//! escalates SIGTERM to SIGKILL on cancellation.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AgentConfig;
use crate::recorder::Recorder;

/// Grace period between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Pipe read buffer size
const READ_BUF: usize = 8192;

/// Runner failure modes; a cancelled or failing agent is a result, not an error
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("agent io: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one agent invocation
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Child exit code; negative when killed by signal or cancelled
    pub exit_code: i32,
    pub duration: Duration,
    /// Captured stdout, bounded by the configured cap (oldest bytes dropped)
    pub output: String,
    /// The run was ended by cancellation or timeout, not by the agent
    pub cancelled: bool,
}

/// Live output chunk forwarded to the daemon's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(String),
    Stderr(String),
}

/// Run one agent subprocess to completion
pub async fn run_process(
    cancel: CancellationToken,
    program: &str,
    args: &[String],
    cfg: &AgentConfig,
    recorder: &Recorder,
    tap: Option<UnboundedSender<OutputEvent>>,
) -> Result<AgentResult, RunnerError> {
    debug!(program, ?args, cwd = %cfg.cwd.display(), "run_process: launching agent");
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&cfg.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if cfg.cwd.as_os_str().is_empty() {
        // inherit the current directory
    } else {
        command.current_dir(&cfg.cwd);
    }

    let mut child = command.spawn().map_err(|e| RunnerError::Launch {
        program: program.to_string(),
        source: e,
    })?;
    let pid = child.id();

    recorder.record_stdin(&cfg.prompt);
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(cfg.prompt.as_bytes()).await {
            // The agent may legitimately exit before reading its prompt
            debug!(error = %e, "run_process: prompt write failed");
        }
        drop(stdin); // close stdin so line-readers see EOF
    }

    let out_task = child.stdout.take().map(|stdout| {
        let recorder = recorder.clone();
        let tap = tap.clone();
        let cap = cfg.output_cap;
        let mirror = cfg.mirror;
        tokio::spawn(async move { pump_stdout(stdout, recorder, tap, cap, mirror).await })
    });
    let err_task = child.stderr.take().map(|stderr| {
        let recorder = recorder.clone();
        let tap = tap.clone();
        let mirror = cfg.mirror;
        tokio::spawn(async move { pump_stderr(stderr, recorder, tap, mirror).await })
    });

    // Waiting happens in a small loop so the handlers never need the child
    // handle: cancellation signals the process group and arms a SIGKILL
    // timer, then the loop keeps waiting for the real exit.
    let mut cancelled = false;
    let mut killer: Option<tokio::task::JoinHandle<()>> = None;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = cancel.cancelled(), if !cancelled => {
                debug!(?pid, "run_process: cancelled, terminating process group");
                cancelled = true;
                killer = Some(terminate_group(pid));
            }
            _ = sleep_opt(cfg.timeout), if !cancelled => {
                warn!(?pid, timeout = ?cfg.timeout, "run_process: agent timed out");
                cancelled = true;
                recorder.record_meta("timeout");
                killer = Some(terminate_group(pid));
            }
        }
    };
    if let Some(killer) = killer {
        killer.abort();
    }

    let output = match out_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    if let Some(task) = err_task {
        let _ = task.await;
    }

    if cancelled {
        recorder.record_meta("cancelled");
    }

    let exit_code = status.code().unwrap_or(-1);
    let duration = start.elapsed();
    debug!(exit_code, ?duration, cancelled, "run_process: agent finished");

    Ok(AgentResult {
        exit_code: if cancelled { -1 } else { exit_code },
        duration,
        output,
        cancelled,
    })
}

/// Sleep for the optional timeout, or forever when unset
async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM the process group now, SIGKILL it after the grace period
///
/// Returns the armed SIGKILL timer; abort it once the child has exited.
fn terminate_group(pid: Option<u32>) -> tokio::task::JoinHandle<()> {
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    tokio::spawn(async move {
        tokio::time::sleep(KILL_GRACE).await;
        if let Some(pid) = pid {
            warn!(pid, "terminate_group: SIGTERM ignored, sending SIGKILL");
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    })
}

async fn pump_stdout(
    stdout: tokio::process::ChildStdout,
    recorder: Recorder,
    tap: Option<UnboundedSender<OutputEvent>>,
    cap: usize,
    mirror: bool,
) -> String {
    let mut reader = stdout;
    let mut captured = String::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "pump_stdout: read failed");
                break;
            }
        };
        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
        recorder.record_stdout(&chunk);
        if let Some(tap) = &tap {
            let _ = tap.send(OutputEvent::Stdout(chunk.clone()));
        }
        if mirror {
            let mut out = tokio::io::stdout();
            let _ = out.write_all(chunk.as_bytes()).await;
            let _ = out.flush().await;
        }

        captured.push_str(&chunk);
        if cap > 0 && captured.len() > cap {
            // keep the newest bytes, on a char boundary
            let mut cut = captured.len() - cap;
            while cut < captured.len() && !captured.is_char_boundary(cut) {
                cut += 1;
            }
            captured.drain(..cut);
        }
    }
    captured
}

async fn pump_stderr(
    stderr: tokio::process::ChildStderr,
    recorder: Recorder,
    tap: Option<UnboundedSender<OutputEvent>>,
    mirror: bool,
) {
    let mut reader = stderr;
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "pump_stderr: read failed");
                break;
            }
        };
        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
        recorder.record_stderr(&chunk);
        if let Some(tap) = &tap {
            let _ = tap.send(OutputEvent::Stderr(chunk.clone()));
        }
        if mirror {
            let mut err = tokio::io::stderr();
            let _ = err.write_all(chunk.as_bytes()).await;
            let _ = err.flush().await;
        }
    }
}
