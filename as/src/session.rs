//! Global session metas under `$HOME/.adaf/sessions/`
//!
//! Each session daemon owns one directory with its meta, control socket,
//! event journal, and log. Ids are globally monotonic (cross-process safe
//! via an advisory file lock). Readers reconcile a meta whose pid died
//! while it still claimed to be live.

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::fsutil::{self, now_ms};
use crate::looprun::StepMeta;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Starting,
    Running,
    Done,
    Cancelled,
    Error,
    Dead,
}

impl SessionStatus {
    /// Statuses that claim a live daemon process
    pub fn claims_live_pid(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.claims_live_pid()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error => write!(f, "error"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// One session daemon's meta record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: u64,
    pub pid: u32,
    #[serde(default)]
    pub status: SessionStatus,
    pub project_path: String,
    pub project_name: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub loop_name: Option<String>,
    /// Loop run this session hosts, recorded once the runtime created it
    #[serde(default)]
    pub loop_run: Option<u64>,
    /// Snapshot of the loop's step descriptors at session creation
    #[serde(default)]
    pub steps: Vec<StepMeta>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
}

/// The per-user session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open the session store under an explicit global root
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fsutil::ensure_dir(&root.join("sessions"))?;
        Ok(Self { root })
    }

    /// Open under the default `$HOME/.adaf`
    pub fn open_default() -> Result<Self> {
        let home =
            dirs::home_dir().ok_or_else(|| StoreError::Internal("cannot resolve home directory".to_string()))?;
        Self::open(home.join(".adaf"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, id: u64) -> PathBuf {
        self.sessions_dir().join(id.to_string())
    }

    pub fn meta_path(&self, id: u64) -> PathBuf {
        self.session_dir(id).join("meta.json")
    }

    pub fn socket_path(&self, id: u64) -> PathBuf {
        self.session_dir(id).join("control.sock")
    }

    pub fn events_path(&self, id: u64) -> PathBuf {
        self.session_dir(id).join("events.jsonl")
    }

    pub fn log_path(&self, id: u64) -> PathBuf {
        self.session_dir(id).join("daemon.log")
    }

    /// Allocate the next global session id
    ///
    /// Serialised across processes by an exclusive advisory lock on the
    /// counter's companion lock file.
    pub fn allocate_id(&self) -> Result<u64> {
        let lock_path = self.sessions_dir().join(".counter.lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io("opening session counter lock", e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| StoreError::io("locking session counter", e))?;

        let counter_path = self.sessions_dir().join(".counter");
        let id = fsutil::next_counter(&counter_path, "session");
        let _ = fs2::FileExt::unlock(&lock_file);
        id
    }

    /// Create a session directory and its initial meta (status `starting`)
    pub fn create_session(&self, mut meta: SessionMeta) -> Result<SessionMeta> {
        debug!(id = meta.id, "create_session: called");
        fsutil::ensure_dir(&self.session_dir(meta.id))?;
        meta.status = SessionStatus::Starting;
        meta.started_at = now_ms();
        fsutil::write_json_atomic(&self.meta_path(meta.id), &meta)?;
        Ok(meta)
    }

    /// Read a meta, reconciling a stale live claim into `dead`
    pub fn meta(&self, id: u64) -> Result<SessionMeta> {
        let mut meta: SessionMeta = fsutil::read_json(&self.meta_path(id), &format!("session {}", id))?;
        if meta.status.claims_live_pid() && !pid_alive(meta.pid) {
            warn!(id, pid = meta.pid, "session pid is gone; reconciling meta to dead");
            meta.status = SessionStatus::Dead;
            meta.ended_at = Some(now_ms());
            // Best-effort rewrite; a racing writer losing here is harmless
            if let Err(e) = fsutil::write_json_atomic(&self.meta_path(id), &meta) {
                warn!(id, error = %e, "failed to persist dead reconciliation");
            }
        }
        Ok(meta)
    }

    /// Update a session meta in place
    pub fn update_meta(&self, id: u64, mutate: impl FnOnce(&mut SessionMeta)) -> Result<SessionMeta> {
        let mut meta: SessionMeta = fsutil::read_json(&self.meta_path(id), &format!("session {}", id))?;
        mutate(&mut meta);
        meta.id = id;
        if meta.status.is_terminal() && meta.ended_at.is_none() {
            meta.ended_at = Some(now_ms());
        }
        fsutil::write_json_atomic(&self.meta_path(id), &meta)?;
        Ok(meta)
    }

    /// All sessions, ascending by id, each reconciled
    pub fn list(&self) -> Result<Vec<SessionMeta>> {
        let mut ids: Vec<u64> = Vec::new();
        let dir = self.sessions_dir();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(format!("reading {}", dir.display()), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("listing sessions", e))?;
            if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.into_iter().map(|id| self.meta(id)).collect()
    }
}

/// Probe a pid with signal 0
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session_store() -> (TempDir, SessionStore) {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path().join(".adaf")).unwrap();
        (temp, store)
    }

    fn meta(id: u64, pid: u32) -> SessionMeta {
        SessionMeta {
            id,
            pid,
            status: SessionStatus::Starting,
            project_path: "/work/demo".to_string(),
            project_name: "demo".to_string(),
            profile: None,
            agent: None,
            loop_name: Some("build".to_string()),
            loop_run: None,
            steps: Vec::new(),
            error: None,
            started_at: 0,
            ended_at: None,
        }
    }

    #[test]
    fn test_allocate_ids_are_monotonic() {
        let (_t, store) = session_store();
        assert_eq!(store.allocate_id().unwrap(), 1);
        assert_eq!(store.allocate_id().unwrap(), 2);
    }

    #[test]
    fn test_create_and_read_meta() {
        let (_t, store) = session_store();
        let id = store.allocate_id().unwrap();
        store.create_session(meta(id, std::process::id())).unwrap();

        let read = store.meta(id).unwrap();
        assert_eq!(read.status, SessionStatus::Starting);
        assert_eq!(read.project_name, "demo");
    }

    /// A pid that is guaranteed dead: a just-reaped child
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_dead_pid_reconciled_on_read() {
        let (_t, store) = session_store();
        let id = store.allocate_id().unwrap();
        store.create_session(meta(id, dead_pid())).unwrap();
        store
            .update_meta(id, |m| m.status = SessionStatus::Running)
            .unwrap();

        let read = store.meta(id).unwrap();
        assert_eq!(read.status, SessionStatus::Dead);
        assert!(read.ended_at.is_some());

        // And the reconciliation is persisted
        let raw: SessionMeta = crate::fsutil::read_json(&store.meta_path(id), "session").unwrap();
        assert_eq!(raw.status, SessionStatus::Dead);
    }

    #[test]
    fn test_live_pid_not_reconciled() {
        let (_t, store) = session_store();
        let id = store.allocate_id().unwrap();
        store.create_session(meta(id, std::process::id())).unwrap();
        store
            .update_meta(id, |m| m.status = SessionStatus::Running)
            .unwrap();

        assert_eq!(store.meta(id).unwrap().status, SessionStatus::Running);
    }

    #[test]
    fn test_terminal_status_not_touched_by_reconcile() {
        let (_t, store) = session_store();
        let id = store.allocate_id().unwrap();
        store.create_session(meta(id, dead_pid())).unwrap();
        store.update_meta(id, |m| m.status = SessionStatus::Done).unwrap();

        assert_eq!(store.meta(id).unwrap().status, SessionStatus::Done);
    }

    #[test]
    fn test_list_orders_by_id() {
        let (_t, store) = session_store();
        for _ in 0..3 {
            let id = store.allocate_id().unwrap();
            store.create_session(meta(id, std::process::id())).unwrap();
        }
        let ids: Vec<u64> = store.list().unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
