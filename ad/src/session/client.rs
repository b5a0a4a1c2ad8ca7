//! Session client: attach to a daemon, stream events, issue control RPCs
//!
//! One connection per concern: an attached connection is a pure event
//! stream, control requests open their own short-lived connections.

use std::time::Duration;

use eyre::{Context, Result, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use adafstore::{SessionStatus, SessionStore, pid_alive};

use super::protocol::{ClientMessage, ProtocolError, ServerMessage, SpawnRequest, read_frame, write_frame};

/// Socket connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Graceful stop window before falling back to signals
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Client handle for one session daemon
#[derive(Debug, Clone)]
pub struct SessionClient {
    sessions: SessionStore,
    id: u64,
}

impl SessionClient {
    pub fn new(sessions: SessionStore, id: u64) -> Self {
        Self { sessions, id }
    }

    async fn connect(&self) -> Result<UnixStream> {
        let path = self.sessions.socket_path(self.id);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .context("control socket connect timeout")?
            .with_context(|| format!("connecting to session {} control socket", self.id))?;
        Ok(stream)
    }

    /// Subscribe to the event stream, replaying from a journal byte offset
    pub async fn attach(&self, replay_from: Option<u64>) -> Result<EventStream> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &ClientMessage::Attach { replay_from })
            .await
            .context("sending attach")?;
        Ok(EventStream {
            stream,
            finished: false,
        })
    }

    /// One request/response exchange on a fresh connection
    pub async fn control(&self, message: ClientMessage) -> Result<ServerMessage> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &message).await.context("sending request")?;
        let reply: Option<ServerMessage> = read_frame(&mut stream).await.context("reading reply")?;
        reply.ok_or_else(|| eyre::eyre!("daemon closed the connection without replying"))
    }

    pub async fn ping(&self) -> Result<()> {
        match self.control(ClientMessage::Ping {}).await? {
            ServerMessage::Pong {} => Ok(()),
            other => bail!("unexpected reply to ping: {:?}", other),
        }
    }

    pub async fn cancel(&self) -> Result<()> {
        match self.control(ClientMessage::Cancel {}).await? {
            ServerMessage::Ok {} => Ok(()),
            ServerMessage::Error { message } => bail!("daemon error: {}", message),
            other => bail!("unexpected reply to cancel: {:?}", other),
        }
    }

    pub async fn wait(&self, turn_id: u64) -> Result<()> {
        match self.control(ClientMessage::Wait { turn_id }).await? {
            ServerMessage::Ok {} => Ok(()),
            ServerMessage::Error { message } => bail!("daemon error: {}", message),
            other => bail!("unexpected reply to wait: {:?}", other),
        }
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<ServerMessage> {
        let reply = self.control(ClientMessage::Spawn { request }).await?;
        match reply {
            ServerMessage::SpawnResult { .. } => Ok(reply),
            ServerMessage::Error { message } => bail!("daemon error: {}", message),
            other => bail!("unexpected reply to spawn: {:?}", other),
        }
    }

    /// Stop the daemon: cancel RPC, bounded wait, then SIGTERM / SIGKILL
    pub async fn stop(&self) -> Result<SessionStatus> {
        if let Err(e) = self.cancel().await {
            debug!(id = self.id, error = %e, "stop: cancel rpc failed, falling back to signals");
        }

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let meta = self.sessions.meta(self.id)?;
            if meta.status.is_terminal() {
                return Ok(meta.status);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let meta = self.sessions.meta(self.id)?;
        if meta.status.is_terminal() {
            return Ok(meta.status);
        }

        warn!(id = self.id, pid = meta.pid, "stop: daemon unresponsive, sending SIGTERM");
        let _ = kill(Pid::from_raw(meta.pid as i32), Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if !pid_alive(meta.pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if pid_alive(meta.pid) {
            warn!(id = self.id, pid = meta.pid, "stop: sending SIGKILL");
            let _ = kill(Pid::from_raw(meta.pid as i32), Signal::SIGKILL);
        }

        // The next read reconciles a killed daemon to `dead`
        Ok(self.sessions.meta(self.id)?.status)
    }
}

/// Decoded event stream of an attached connection
#[derive(Debug)]
pub struct EventStream {
    stream: UnixStream,
    finished: bool,
}

impl EventStream {
    /// Next event; `None` after the stream ended
    ///
    /// A connection lost mid-stream surfaces as a synthetic
    /// `done{error: "connection lost"}` before the stream ends.
    pub async fn next(&mut self) -> Option<ServerMessage> {
        if self.finished {
            return None;
        }
        match read_frame::<_, ServerMessage>(&mut self.stream).await {
            Ok(Some(message)) => {
                if matches!(message, ServerMessage::Done { .. }) {
                    self.finished = true;
                }
                Some(message)
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(ProtocolError::UnexpectedEof) | Err(ProtocolError::Io(_)) => {
                self.finished = true;
                Some(ServerMessage::Done {
                    error: Some("connection lost".to_string()),
                })
            }
            Err(e) => {
                warn!(error = %e, "attach stream: protocol error");
                self.finished = true;
                Some(ServerMessage::Done {
                    error: Some(format!("protocol error: {}", e)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentOverride, Config, Profile};
    use crate::orchestrator::LaunchMode;
    use crate::r#loop::LoopDefinition;
    use crate::session::daemon::{DaemonConfig, create_session, run_session};
    use adafstore::Store;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn stub_config(script: &str) -> Config {
        let mut config = Config::default();
        config.agents.insert(
            "generic".to_string(),
            AgentOverride {
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), script.to_string()],
                env: BTreeMap::new(),
            },
        );
        config.profiles.insert("ask:generic".to_string(), Profile::default());
        config
    }

    async fn start_session(temp: &TempDir, script: &str) -> (SessionStore, u64, tokio::task::JoinHandle<()>) {
        let project_dir = temp.path().join("repo");
        std::fs::create_dir_all(&project_dir).unwrap();
        Store::open_project(&project_dir).unwrap();
        let sessions = SessionStore::open(temp.path().join("global")).unwrap();

        let cfg = DaemonConfig {
            project_dir: project_dir.clone(),
            work_dir: project_dir,
            definition: LoopDefinition::single_step("ask", "ask:generic", "run"),
            snapshot: stub_config(script),
            plan: None,
            parent_turn: None,
        };
        let id = create_session(&sessions, &cfg).unwrap();

        let handle = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let _ = run_session(sessions, id, CancellationToken::new(), LaunchMode::Inline, false).await;
            })
        };

        let socket = sessions.socket_path(id);
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        (sessions, id, handle)
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let temp = TempDir::new().unwrap();
        let (sessions, id, handle) = start_session(&temp, "sleep 1").await;

        let client = SessionClient::new(sessions, id);
        client.ping().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_streams_to_done() {
        let temp = TempDir::new().unwrap();
        let (sessions, id, handle) = start_session(&temp, "echo alpha; echo beta").await;

        let client = SessionClient::new(sessions, id);
        let mut stream = client.attach(None).await.unwrap();

        let mut raw = String::new();
        let mut done = false;
        while let Some(message) = stream.next().await {
            match message {
                ServerMessage::Raw { data } => raw.push_str(&data),
                ServerMessage::Done { error } => {
                    assert_eq!(error, None);
                    done = true;
                }
                _ => {}
            }
        }
        assert!(done);
        assert!(raw.contains("alpha"));
        assert!(raw.contains("beta"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_daemon() {
        let temp = TempDir::new().unwrap();
        let (sessions, id, handle) = start_session(&temp, "sleep 30").await;

        let client = SessionClient::new(sessions.clone(), id);
        let status = client.stop().await.unwrap();
        assert_eq!(status, SessionStatus::Cancelled);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_rpc_acknowledged() {
        let temp = TempDir::new().unwrap();
        let (sessions, id, handle) = start_session(&temp, "sleep 1").await;

        let client = SessionClient::new(sessions, id);
        client.wait(7).await.unwrap();
        handle.await.unwrap();
    }
}
